// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Process Configuration
//!
//! Connection identity and broker settings read from the environment. Variables follow the
//! `<SECTION>_<KEY>` convention, e.g. `APP_NAME` or `RABBITMQ_HOST`.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use tracing::error;

/// Identity of the running application.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppConfigs {
    /// Used as the connection name and stamped as `app-id` on published messages.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "app".to_owned(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Unacknowledged deliveries the broker may push to a consumer at once.
    pub prefetch: u16,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            prefetch: 10,
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the `amqp://` URI used to open the connection.
    ///
    /// An empty vhost selects the broker's default vhost.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl Configs {
    /// Loads the configs from the process environment, falling back to the defaults for
    /// every variable that is not set.
    pub fn from_env() -> Result<Configs, AmqpError> {
        Self::load(Environment::default())
    }

    fn load(env: Environment) -> Result<Configs, AmqpError> {
        let defaults = Configs::default();

        let build = || -> Result<Configs, config::ConfigError> {
            Config::builder()
                .set_default("app.name", defaults.app.name.clone())?
                .set_default("rabbitmq.host", defaults.rabbitmq.host.clone())?
                .set_default("rabbitmq.port", defaults.rabbitmq.port as i64)?
                .set_default("rabbitmq.user", defaults.rabbitmq.user.clone())?
                .set_default("rabbitmq.password", defaults.rabbitmq.password.clone())?
                .set_default("rabbitmq.vhost", defaults.rabbitmq.vhost.clone())?
                .set_default("rabbitmq.prefetch", defaults.rabbitmq.prefetch as i64)?
                .add_source(env.separator("_").try_parsing(true))
                .build()?
                .try_deserialize()
        };

        build().map_err(|err| {
            error!(error = err.to_string(), "failure to load configs");
            AmqpError::InvalidConfigs(err.to_string())
        })
    }
}
