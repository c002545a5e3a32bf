use bos_error::{EXIT_GENERIC, EXIT_OK};
use clap::Parser;

mod cancel;
mod cli;
mod commands;
mod logging;
mod prompt;

fn main() {
    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_GENERIC } else { EXIT_OK };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init(cli.log_file.as_deref(), cli.verbose);

    let code = match commands::run(&cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            EXIT_GENERIC
        }
    };
    std::process::exit(code);
}
