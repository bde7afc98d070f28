//! netdupe command-line entry point.

use clap::Parser;
use netdupe::{
    cli::Cli,
    error::{ExitCode, StructuredError},
    AppError,
};

fn main() {
    let cli = Cli::parse();
    let json_errors = cli.json_errors;

    match netdupe::run_app(cli) {
        Ok(code) => std::process::exit(code.as_i32()),
        Err(err) => {
            let exit_code = if err
                .downcast_ref::<AppError>()
                .is_some_and(|e| matches!(e, AppError::Interrupted))
            {
                ExitCode::Interrupted
            } else {
                ExitCode::GeneralError
            };

            if json_errors {
                let structured = StructuredError::new(&err, exit_code);
                match serde_json::to_string_pretty(&structured) {
                    Ok(json) => eprintln!("{json}"),
                    Err(_) => eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err),
                }
            } else {
                eprintln!("[{}] Error: {:#}", exit_code.code_prefix(), err);
            }

            std::process::exit(exit_code.as_i32());
        }
    }
}
