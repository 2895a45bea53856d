use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "stats-recorder-rs",
    version,
    about = "Rolling statistics recorder service"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8090)]
    pub port: u16,
    /// Disable the 5-minute background compilation timer (compile on demand only).
    #[arg(long, default_value_t = false)]
    pub no_compile_timer: bool,
}
