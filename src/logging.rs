use env_logger::{Builder, Env, Target};
use std::io::Write;

/// Initialize logging for a binary
///
/// Errors always go to stderr. Everything else goes to `target`, undecorated.
pub fn init(target: Target) {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(target).init();
}
