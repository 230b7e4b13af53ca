//! Glacier CLI: runs the configured continuous transforms until shutdown.

use std::process::ExitCode;

use glacier::Config;
use glacier_core::Application;

fn main() -> ExitCode {
    Application::<Config>::run()
}
