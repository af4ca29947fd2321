use std::env;
use std::time::Duration;

use crate::engine::view_model::SessionOptions;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub poll_interval: Duration,
    pub event_buffer_size: usize,
    pub assumed_speed_kmh: f64,
    pub demo_step: Duration,
    pub public_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let assumed_speed_kmh = validate_speed(parse_or_default("ASSUMED_SPEED_KMH", 30.0)?)?;

        let poll_interval_secs: u64 = parse_or_default("POLL_INTERVAL_SECS", 10)?;
        if poll_interval_secs == 0 {
            return Err(AppError::Internal(
                "invalid POLL_INTERVAL_SECS: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            poll_interval: Duration::from_secs(poll_interval_secs),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 256)?,
            assumed_speed_kmh,
            demo_step: Duration::from_secs(parse_or_default("DEMO_STEP_SECS", 20)?),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll_interval: self.poll_interval,
            assumed_speed_kmh: self.assumed_speed_kmh,
            event_buffer_size: self.event_buffer_size,
            auto_refresh: true,
            notifications: true,
            public_base_url: self.public_base_url.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(10),
            event_buffer_size: 256,
            assumed_speed_kmh: 30.0,
            demo_step: Duration::from_secs(20),
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

fn validate_speed(speed_kmh: f64) -> Result<f64, AppError> {
    if speed_kmh.is_finite() && speed_kmh > 0.0 {
        Ok(speed_kmh)
    } else {
        Err(AppError::Internal(format!(
            "invalid ASSUMED_SPEED_KMH: {speed_kmh} is not a positive finite speed"
        )))
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
