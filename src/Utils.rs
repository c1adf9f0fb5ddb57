//! different utility modules used throughout the project
/// tiny module to initialize logging and save vectors/trajectories into files
pub mod logger;
/// solver settings: defaults, TOML parsing, validation
pub mod settings;
