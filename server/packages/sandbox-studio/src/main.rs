use sandbox_studio::cli::run_sandbox_studio;

fn main() {
    if let Err(err) = run_sandbox_studio() {
        tracing::error!(error = %err, "sandbox-studio failed");
        std::process::exit(1);
    }
}
