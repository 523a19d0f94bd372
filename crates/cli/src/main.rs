use std::process::ExitCode;

fn main() -> ExitCode {
    edgesec_cli::run()
}
