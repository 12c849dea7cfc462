use atlas_crawler_lib::{cli::parse_args, commands, logging::format_error_report};

#[tokio::main]
async fn main() {
    let cli = parse_args();

    if let Err(err) = commands::run(cli).await {
        let error_report = format_error_report(&err);
        tracing::error!(
            event = "crawler_failed",
            error = %err,
            error_report = %error_report,
            "crawler exited with an error"
        );
        eprintln!("{error_report}");
        std::process::exit(1);
    }
}
