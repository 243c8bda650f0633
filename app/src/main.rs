use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::CommandFactory;

use caller::cli::{parse_args, Cli};
use caller::settings::{log_filter, Settings};

fn main() -> ExitCode {
    if std::env::args_os().len() <= 1 {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    }

    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    let settings = Settings::from(cli);

    let env = env_logger::Env::default()
        .filter_or("CALLER_LOG", log_filter(settings.log_level))
        .write_style_or("CALLER_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    match caller::run(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
