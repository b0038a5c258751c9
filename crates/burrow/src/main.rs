use std::process::ExitCode;

fn main() -> ExitCode {
  match burrow::run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      if err.downcast_ref::<burrow::config::ValidationError>().is_some() {
        // Offenders were already listed one per line.
        ExitCode::from(2)
      } else {
        eprintln!("{err:#}");
        ExitCode::from(1)
      }
    }
  }
}
