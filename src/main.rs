use crate::config::Config;
use crate::utils::sos::SignalOfStop;
use std::{panic, process};

pub mod assets;
pub mod audio;
pub mod config;
pub mod decoder;
pub mod net;
pub mod pipeline;
pub mod player;
pub mod render;
pub mod utils;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = config::command().get_matches();
    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{:#}", e);
            process::exit(2);
        }
    };

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    // first signal stops playback gracefully, the second one exits right away
    let stop = SignalOfStop::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_stop.cancelled() {
            process::exit(130);
        }
        handler_stop.cancel();
    }) {
        log::warn!("Unable to install the signal handler: {}", e);
    }

    log::info!("{} {} starting as {:?}", config::app_name(), config::version(), config.role);

    if let Err(e) = player::run(&config, &stop) {
        log::error!("{:#}", e);
        process::exit(1);
    }

    if stop.cancelled() {
        process::exit(130);
    }
}
