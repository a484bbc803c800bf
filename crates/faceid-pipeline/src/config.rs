use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not configured")]
    Missing(&'static str),
}

/// Outbound channel identifiers used by the stages.
///
/// Each stage resolves what it needs per invocation, so a missing value
/// surfaces as a configuration error on the handling attempt rather than
/// a panic.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Next-stage channel carrying face crops (detection → recognition).
    pub crop_channel: Option<String>,
    /// Channel receiving identification results.
    pub response_channel: Option<String>,
}

impl ChannelConfig {
    pub fn new(crop_channel: impl Into<String>, response_channel: impl Into<String>) -> Self {
        Self {
            crop_channel: Some(crop_channel.into()),
            response_channel: Some(response_channel.into()),
        }
    }

    pub fn crop_channel(&self) -> Result<&str, ConfigError> {
        required(&self.crop_channel, "crop channel")
    }

    pub fn response_channel(&self) -> Result<&str, ConfigError> {
        required(&self.response_channel, "response channel")
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}
