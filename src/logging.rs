// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs the process wide `tracing` subscriber. `RUST_LOG` wins over the
//! configured level.

use crate::{config::LoggingConfigs, errors::AmqpError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(cfg: &LoggingConfigs) -> Result<(), AmqpError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if cfg.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|err| AmqpError::InternalError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_install_subscriber_once() {
        let cfg = LoggingConfigs {
            level: "debug".to_owned(),
            json: true,
        };

        assert_eq!(init(&cfg), Ok(()));
        assert!(matches!(init(&cfg), Err(AmqpError::InternalError(_))));
    }
}
