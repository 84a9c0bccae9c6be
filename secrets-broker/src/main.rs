use std::process;

use clap::Parser;
use secrets_broker::BrokerConfig;

const CONFIG_HELP: &str = "\
Required environment:
  INFISICAL_CLIENT_ID        Universal Auth client id
  INFISICAL_CLIENT_SECRET    Universal Auth client secret
  INFISICAL_PROJECT_ID       Infisical project (workspace) id
  AUTH_JWT_ED25519_PUB       Comma separated base64url Ed25519 token issuer keys
    or AUTH_JWT_JWKS_PATH    JWKS file holding the issuer keys

Optional environment:
  INFISICAL_BASE_URL         default https://app.infisical.com
  INFISICAL_ENVIRONMENT      default prod
  INFISICAL_SECRET_PATH      default /
  NATS_URL                   default nats://localhost:4222
  NATS_CREDS_FILE            NATS credentials file
  NATS_SUBJECT_PREFIX        default wasmcloud.secrets
  BACKEND_NAME               default infisical
  API_VERSION                default v1alpha1
  AUTH_CLOCK_SKEW_SECS       default 0
  STORE_TIMEOUT_SECS         default 5
  SERVER_XKEY_SECRET         base64 x25519 private key to keep the service key across restarts
  POLICY_ALLOWED_KINDS       component,provider
  POLICY_ALLOWED_ENVIRONMENTS
  POLICY_ALLOWED_PROJECTS    default INFISICAL_PROJECT_ID, * for any
  RUST_LOG                   default info";

#[derive(Parser)]
#[command(name = "xkey-secrets-broker", version, about, after_help = CONFIG_HELP)]
struct BrokerArgs {
    /// Override NATS URL
    #[arg(long)]
    nats_url: Option<String>,
    /// Override NATS subject prefix
    #[arg(long)]
    subject_prefix: Option<String>,
    /// Override backend name used in subjects
    #[arg(long)]
    backend_name: Option<String>,
    /// Validate configuration and trust anchors, then exit
    #[arg(long)]
    check_config: bool,
}

impl BrokerArgs {
    fn override_for(&self, key: &str) -> Option<String> {
        match key {
            "NATS_URL" => self.nats_url.clone(),
            "NATS_SUBJECT_PREFIX" => self.subject_prefix.clone(),
            "BACKEND_NAME" => self.backend_name.clone(),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("broker exited with error: {err:#}");
        eprintln!("run with --help to list configuration variables");
        process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    let args = BrokerArgs::parse();
    secrets_broker::telemetry::init()?;

    let config = BrokerConfig::from_lookup(|key| {
        args.override_for(key)
            .or_else(|| std::env::var(key).ok())
    })?;

    if args.check_config {
        let anchors = config.trust_anchors()?;
        println!("get subject:         {}", config.get_subject());
        println!("server_xkey subject: {}", config.server_xkey_subject());
        println!("nats url:            {}", config.nats.url);
        println!("infisical:           {}", config.infisical.base_url);
        println!("trust anchors:       {}", anchors.len());
        return Ok(());
    }

    secrets_broker::run(config).await
}
