//! Command line arguments for the providers.

use crate::settings::{FlagsSettings, SECRET_ID_ENV, SecretsSettings, Settings};
use clap::Args;
use skyconf_provider::flags::DEFAULT_FLAG_PREFIX;
use std::time::Duration;
use url::Url;

/// Command line switches for every dynamic configuration provider.
#[derive(Clone, Debug, Args)]
pub struct SkyconfArgs {
    /// Secret override provider
    #[command(flatten)]
    pub secrets: SecretsArgs,

    /// Feature flag provider
    #[command(flatten)]
    pub flags: FlagsArgs,
}

impl SkyconfArgs {
    /// Settings selected on the command line; disabled providers are `None`.
    pub fn settings(&self) -> Settings {
        Settings { secrets: self.secrets.settings(), flags: self.flags.settings() }
    }
}

/// Loads configuration overrides from a secret store.
#[derive(Clone, Debug, Default, Args)]
pub struct SecretsArgs {
    /// Enable secret overrides.
    #[arg(id = "secrets.enable", long = "secrets.enable", default_value_t = false)]
    pub enabled: bool,

    /// Name or ARN of the secret holding the overrides.
    #[arg(long = "secrets.id", value_name = "SECRET_ID", env = SECRET_ID_ENV)]
    pub secret_id: Option<String>,

    /// How often the secret is polled, e.g. `90s` or `5m`.
    #[arg(long = "secrets.interval", value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,
}

impl SecretsArgs {
    fn settings(&self) -> Option<SecretsSettings> {
        let defaults = SecretsSettings::default();
        self.enabled.then(|| SecretsSettings {
            secret_id: self.secret_id.clone(),
            min_refresh_interval: self.interval.unwrap_or(defaults.min_refresh_interval),
            ..defaults
        })
    }
}

/// Mirrors feature flags into configuration.
#[derive(Clone, Debug, Args)]
pub struct FlagsArgs {
    /// Enable the feature flag provider.
    #[arg(id = "flags.enable", long = "flags.enable", default_value_t = false)]
    pub enabled: bool,

    /// SDK key for the flag service.
    #[arg(long = "flags.sdk-key", value_name = "SDK_KEY")]
    pub sdk_key: Option<String>,

    /// Only flags whose key starts with this prefix become configuration.
    #[arg(long = "flags.prefix", value_name = "PREFIX", default_value = DEFAULT_FLAG_PREFIX)]
    pub prefix: String,

    /// Override for the streaming endpoint.
    #[arg(long = "flags.stream-uri", value_name = "URL")]
    pub stream_uri: Option<Url>,
}

impl FlagsArgs {
    fn settings(&self) -> Option<FlagsSettings> {
        self.enabled.then(|| FlagsSettings {
            sdk_key: self.sdk_key.clone(),
            prefix: self.prefix.clone(),
            stream_uri: self.stream_uri.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use clap::Parser;

    /// A helper type to parse Args more easily
    #[derive(Parser)]
    struct CommandParser<T: Args> {
        #[command(flatten)]
        args: T,
    }

    fn parse(argv: &[&str]) -> SkyconfArgs {
        temp_env::with_var_unset(SECRET_ID_ENV, || {
            CommandParser::<SkyconfArgs>::parse_from(std::iter::once("skyconf").chain(argv.iter().copied())).args
        })
    }

    #[test]
    fn test_defaults_disable_everything() {
        let args = parse(&[]);
        assert!(!args.secrets.enabled);
        assert!(!args.flags.enabled);
        assert_eq!(args.flags.prefix, DEFAULT_FLAG_PREFIX);
        assert_eq!(args.settings(), Settings::default());
    }

    #[test]
    fn test_parse_secrets_args() {
        let args = parse(&["--secrets.enable", "--secrets.id", "arn:cli", "--secrets.interval", "5m"]);
        let options = args.settings().secrets.unwrap().to_options().unwrap();
        assert_eq!(options.secret_id, "arn:cli");
        assert_eq!(options.min_refresh_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_secret_id_from_env() {
        let args = temp_env::with_var(SECRET_ID_ENV, Some("arn:env"), || {
            CommandParser::<SkyconfArgs>::parse_from(["skyconf", "--secrets.enable"]).args
        });
        assert_eq!(args.secrets.secret_id.as_deref(), Some("arn:env"));
    }

    #[test]
    fn test_enabled_without_id_is_missing_field() {
        let settings = parse(&["--secrets.enable"]).settings();
        assert!(matches!(
            settings.secrets.unwrap().to_options(),
            Err(SourceError::MissingField("secrets.secret_id"))
        ));
    }

    #[test]
    fn test_parse_flags_args() {
        let args = parse(&[
            "--flags.enable",
            "--flags.sdk-key",
            "sdk-1",
            "--flags.prefix",
            "svc-",
            "--flags.stream-uri",
            "https://stream.example.com",
        ]);
        let options = args.settings().flags.unwrap().to_options().unwrap();
        assert_eq!(options.sdk_key, "sdk-1");
        assert_eq!(options.prefix, "svc-");
        assert_eq!(options.client.stream_uri.unwrap().host_str(), Some("stream.example.com"));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let result = CommandParser::<SkyconfArgs>::try_parse_from(["skyconf", "--secrets.interval", "soon"]);
        assert!(result.is_err());
    }
}
