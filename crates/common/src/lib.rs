// atrium-common: shared types for the atrium workspace

pub mod protocol;
