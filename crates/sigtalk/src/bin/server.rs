use clap::Parser;
use eyre::WrapErr;
use sigtalk::{
    cli::ServerArgs,
    server_side::{ServerConfig, run_server},
    tracing_init::init_tracing,
};

fn main() -> eyre::Result<()> {
    let args = ServerArgs::parse();
    init_tracing(args.log_path.as_deref())
        .wrap_err("could not initialize logging")?;

    run_server(&ServerConfig::from(&args)).wrap_err("server setup failed")?;
    Ok(())
}
