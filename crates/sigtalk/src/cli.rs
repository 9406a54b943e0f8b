use std::{error::Error as _, ffi::OsString, path::PathBuf};

use clap::{CommandFactory, Parser, error::ErrorKind};
use nix::unistd::Pid;
use sigtalk_common::protocol_common::{
    DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_BIT_DELAY, parse_pid,
};

static HELP_STR_LOG_PATH: &str = "
    Optional log file. Without it, logs go to stderr. Verbosity follows \
                                  RUST_LOG (default: info). Example value: \
                                  \"/tmp/sigtalk.log\"
";

#[derive(clap::Parser, Debug)]
#[command(
    name = "server",
    version,
    about = "Receive messages sent one signal per bit",
    long_about = "Prints its process id, then waits for SIGUSR1 (bit 1) and \
                  SIGUSR2 (bit 0). Each complete message is printed on its \
                  own line."
)]
pub struct ServerArgs {
    #[arg(
        long,
        help = "Send SIGUSR1 back to the client once its message is printed"
    )]
    pub ack: bool,

    #[arg(
        long,
        value_name = "BYTES",
        help = "Largest capacity the message buffer may grow to. A message \
                that needs more is dropped. Default: unbounded"
    )]
    pub max_buffer_capacity: Option<usize>,

    #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG_PATH)]
    pub log_path: Option<PathBuf>,
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "client",
    version,
    about = "Send a message to a server one signal per bit",
    long_about = "Encodes MESSAGE most significant bit first, SIGUSR1 for 1 \
                  and SIGUSR2 for 0, followed by a zero byte."
)]
pub struct ClientArgs {
    #[arg(
        value_name = "PID",
        value_parser = pid_value_parser,
        help = "Process id printed by the server. Example value: 4242"
    )]
    pub pid: Pid,

    #[arg(value_name = "MESSAGE", help = "Text to send")]
    pub message: OsString,

    #[arg(
        long,
        help = "Wait for the server to acknowledge the message"
    )]
    pub ack: bool,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = DEFAULT_ACK_TIMEOUT_SECS,
        help = "How long to wait for the acknowledgment, polled once a second"
    )]
    pub ack_timeout: u32,

    #[arg(
        long,
        value_name = "MICROS",
        default_value_t = DEFAULT_BIT_DELAY.as_micros() as u64,
        help = "Pause after every signal so the server keeps up"
    )]
    pub bit_delay_us: u64,

    #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG_PATH)]
    pub log_path: Option<PathBuf>,
}

fn pid_value_parser(raw: &str) -> Result<Pid, String> {
    parse_pid(raw).map_err(|e| e.to_string())
}

/// Parse client arguments from `argv`. A rejected value (a bad pid) is
/// reported together with the usage line, the same way a missing argument
/// is, instead of clap's bare "invalid value" message.
pub fn try_parse_client_from<I, T>(argv: I) -> Result<ClientArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    ClientArgs::try_parse_from(argv).map_err(|err| {
        if err.kind() != ErrorKind::ValueValidation {
            return err;
        }
        let reason = match err.source() {
            Some(source) => source.to_string(),
            None => "invalid argument value".to_owned(),
        };
        clap::Error::raw(ErrorKind::ValueValidation, reason)
            .with_cmd(&ClientArgs::command())
    })
}
