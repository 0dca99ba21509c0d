use std::process::ExitCode;

fn main() -> ExitCode {
    stagehand_cli::run()
}
