use clap::Parser;

mod archive;
mod cli;
mod config;
mod dirconfig;
mod dup_check;
mod error;
mod layout;
mod lock_order;
mod protocol;
mod rate_limit;
mod retrieve_list;
mod scheduler;
mod state;
mod supervisor;
mod util;
mod worker;

fn main() {
    let cli = cli::Cli::parse();

    let config = match config::Config::init(0) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: could not load configuration: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match &cli.command {
        None | Some(cli::Commands::Run) => run_foreground(config, cli.debug),
        Some(other) => {
            let line = other.as_fifo_line().expect("every non-Run subcommand has a fifo line");
            send_to_running_daemon(&config, &line)
        }
    };

    std::process::exit(exit_code);
}

fn run_foreground(config: config::Config, debug: bool) -> i32 {
    match supervisor::run(config, debug) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

fn send_to_running_daemon(config: &config::Config, line: &str) -> i32 {
    let work_layout = layout::WorkDirLayout::new(config.work_dir.clone());
    match supervisor::send_command(&work_layout, line) {
        Ok(response) => {
            println!("{response}");
            if response.starts_with("error") { 1 } else { 0 }
        }
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}
