//! Package-level constants.

/// Current version of Tableside (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "tableside";

/// Client identifier sent with the tenant handshake.
pub const CLIENT_NAME: &str = concat!("tableside/", env!("CARGO_PKG_VERSION"));
