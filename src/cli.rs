//! Command line handling

pub const USAGE: &str = "\
Usage: padkill [-d] [--install] [--uninstall]

Disconnects a wireless PlayStation controller when Home + Triangle are pressed.

Options:
  -d            print diagnostics to stderr
  --install     install and start the systemd service
  --uninstall   stop and remove the systemd service
  -h, --help    show this help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    Install,
    Uninstall,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Args {
    pub debug: bool,
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CliError {
    #[error("unknown argument '{0}'")]
    Unknown(String),

    #[error("--install and --uninstall cannot be combined")]
    Conflict,
}

pub fn parse<I>(args: I) -> Result<Args, CliError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut debug = false;
    let mut install = false;
    let mut uninstall = false;
    let mut help = false;

    for arg in args {
        match arg.as_ref() {
            "-d" => debug = true,
            "--install" => install = true,
            "--uninstall" => uninstall = true,
            "-h" | "--help" => help = true,
            other => return Err(CliError::Unknown(other.to_string())),
        }
    }

    let command = match (help, install, uninstall) {
        (true, _, _) => Command::Help,
        (false, true, true) => return Err(CliError::Conflict),
        (false, true, false) => Command::Install,
        (false, false, true) => Command::Uninstall,
        (false, false, false) => Command::Run,
    };

    Ok(Args { debug, command })
}
