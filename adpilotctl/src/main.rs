use clap::Parser;

fn main() {
    let cli = adpilotctl::Cli::parse();
    if let Err(err) = adpilotctl::run(cli) {
        eprintln!("{}", err.to_record());
        std::process::exit(1);
    }
}
