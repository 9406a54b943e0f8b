use std::process::ExitCode;

use eyre::WrapErr;
use sigtalk::{
    cli::try_parse_client_from,
    client_side::{ClientConfig, Delivery, run_client},
    tracing_init::init_tracing,
};
use sigtalk_common::protocol_common::ProtocolError;
use tracing::{error, info};

// 2 is clap's usage error
const EXIT_SEND_FAILED: u8 = 1;
const EXIT_ACK_TIMEOUT: u8 = 3;

fn main() -> eyre::Result<ExitCode> {
    let args = try_parse_client_from(std::env::args_os())
        .unwrap_or_else(|err| err.exit());
    init_tracing(args.log_path.as_deref())
        .wrap_err("could not initialize logging")?;

    let config = ClientConfig::from(args);
    let server = config.target.as_raw();

    let code = match run_client(&config) {
        Ok(Delivery::Sent { bits }) => {
            info!(server, bits, "message sent");
            ExitCode::SUCCESS
        }
        Ok(Delivery::Acknowledged { bits, waited_secs }) => {
            info!(server, bits, waited_secs, "message acknowledged");
            println!("Server {server} acknowledged the message.");
            ExitCode::SUCCESS
        }
        Err(err @ ProtocolError::AckTimeout { .. }) => {
            error!(server, %err, "server did not acknowledge the message");
            ExitCode::from(EXIT_ACK_TIMEOUT)
        }
        Err(err) => {
            error!(server, %err, "could not send message");
            ExitCode::from(EXIT_SEND_FAILED)
        }
    };
    Ok(code)
}
