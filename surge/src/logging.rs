//! Tracing setup for binaries and examples built on surge.
use tracing_subscriber::{filter::ParseError, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, with `default_directive`
/// (e.g. `"surge=info"`) applied on top.
///
/// Returns `Ok(false)` when a global subscriber was already installed, so
/// calling it more than once is harmless.
pub fn init(default_directive: &str) -> Result<bool, ParseError> {
    let filter = EnvFilter::from_default_env().add_directive(default_directive.parse()?);
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        // another test may have won the race for the global subscriber
        let _ = init("surge=debug").unwrap();
        assert!(!init("surge=info").unwrap());
    }

    #[test]
    fn bad_directive_is_rejected() {
        assert!(init("surge=loud").is_err());
    }
}
