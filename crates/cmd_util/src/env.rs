use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::EnvFilter;

/// Read a knob from the environment, falling back to `default` if the
/// variable is unset or doesn't parse.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let raw = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Non-unicode value for {name}, using default {default:?}");
            return default;
        },
    };
    match T::from_str(&raw) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Couldn't parse {raw:?} for {name}, using default {default:?}: {e:?}");
            default
        },
    }
}

/// Tracing subscriber for tests, filtered by `RUST_LOG`.
pub fn config_test() {
    // Tests call this from many helpers, so a second initialization failing is
    // expected and harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
