use std::process::ExitCode;

fn main() -> ExitCode {
    credeval_cli::run()
}
