//! `kestreld`: the Kestrel SPV wallet node.

mod config;
mod node;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use gumdrop::Options;
use tracing::error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kestrel_chain::amount::Amount;
use kestrel_chain::transparent::Address;

use crate::config::Config;
use crate::node::{PaymentRequest, StartupError};

#[derive(Debug, Options)]
struct Args {
    #[options(help = "print this help message")]
    help: bool,

    #[options(help = "path to a kestreld.toml configuration file")]
    config: Option<PathBuf>,

    #[options(no_short, help = "network to join: prod or test")]
    network: Option<String>,

    #[options(no_short, help = "data directory for the wallet store")]
    data_dir: Option<PathBuf>,

    #[options(no_short, help = "force a peer (repeatable); disables DNS seeds")]
    connect: Vec<SocketAddr>,

    #[options(no_short, help = "wallet passphrase")]
    passphrase: Option<String>,

    #[options(no_short, help = "log filter, e.g. info or kestrel_network=debug")]
    log_level: Option<String>,

    #[options(no_short, help = "override the peer-to-peer port")]
    port: Option<u16>,

    #[options(no_short, help = "accept inbound connections")]
    listen: bool,

    #[options(no_short, help = "send a payment to this address once synced")]
    send_to: Option<String>,

    #[options(no_short, help = "payment amount in satoshi")]
    amount: Option<i64>,

    #[options(no_short, help = "payment fee in satoshi")]
    fee: Option<i64>,
}

fn main() {
    exit(real_main());
}

fn real_main() -> i32 {
    let args = Args::parse_args_default_or_exit();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("{}", error);
                return 1;
            }
        },
        None => Config::default(),
    };

    // Flags override the file.
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if !args.connect.is_empty() {
        config.connect = args.connect;
    }
    if let Some(passphrase) = args.passphrase {
        config.passphrase = Some(passphrase);
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if args.listen {
        config.listen = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .init();

    let payment = match payment_request(&args.send_to, args.amount, args.fee, &config) {
        Ok(payment) => payment,
        Err(message) => {
            error!("{}", message);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot start runtime: {}", err);
            return 1;
        }
    };

    match runtime.block_on(node::run(config, payment)) {
        Ok(()) => 0,
        Err(StartupError::WrongPassphrase) => {
            error!("{}", StartupError::WrongPassphrase);
            2
        }
        Err(error) => {
            error!("{}", error);
            1
        }
    }
}

fn payment_request(
    send_to: &Option<String>,
    amount: Option<i64>,
    fee: Option<i64>,
    config: &Config,
) -> Result<Option<PaymentRequest>, String> {
    let send_to = match send_to {
        Some(send_to) => send_to,
        None => return Ok(None),
    };
    let to: Address = send_to
        .parse()
        .map_err(|_| format!("cannot parse address {:?}", send_to))?;
    let network = config.network()?;
    if to.network != network {
        return Err(format!(
            "address {} belongs to the wrong network",
            send_to
        ));
    }
    let amount = amount.ok_or_else(|| "a payment needs --amount".to_owned())?;
    let fee = fee.ok_or_else(|| "a payment needs --fee".to_owned())?;
    if amount <= 0 || fee < 0 {
        return Err("payment amounts must be positive".to_owned());
    }
    Ok(Some(PaymentRequest {
        to,
        amount: Amount(amount),
        fee: Amount(fee),
    }))
}
