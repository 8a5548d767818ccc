//! ESPore command line interface.

use std::fs::{self, File};
use std::path::Path;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
};
use console::style;
use log::{debug, trace, LevelFilter};
use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher};
use simplelog::*;

use espore::cli::{self, History};
use espore::{builder, fwserver, initializer, utils};
use espore::{EsporeConfig, Session, SettingsBuilder};

fn main() {
    println!("[espore] v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(0);
    })
    .expect("Failed to install the Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Espore composes deterministic firmware images from reusable \
            script libraries and drives NodeMCU-class devices over their \
            serial REPL.\n\
            \n\
            Without mode flags, espore runs a single build of every device \
            configured in espore.json. The mode flags combine:\n\
               \t* --watch keeps rebuilding when source directories change \n\
               \t* --initialize pushes the freshly built image to the device \n\
               \t* --cli opens the interactive workspace \n\
               \t* --server publishes built images over HTTP\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("WATCH")
                .help("build, then keep watching the configured directories")
                .long("--watch"),
        )
        .arg(
            Arg::with_name("INITIALIZE")
                .help("open the serial link, push the device's image and restart")
                .long("--initialize"),
        )
        .arg(
            Arg::with_name("CLI")
                .help("run the interactive workspace")
                .long("--cli"),
        )
        .arg(
            Arg::with_name("SERVER")
                .help("serve built images over HTTP on port 8080")
                .long("--server"),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device to use")
                .long_help(
                    "the USB tty device to use; may change when the board \
                     is unplugged and re-plugged and may differ between \
                     systems. When the path does not exist, espore offers \
                     the connected ports for selection.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose"
    // flag (i.e. 'espore -v -v -v' or 'espore -vvv' vs 'espore -v')
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let config = match EsporeConfig::read() {
        Ok(config) => config,
        Err(e) => fatal(&format!("reading espore.json: {}", e)),
    };
    let data_dir = config.data_dir();
    if let Err(e) = fs::create_dir_all(&data_dir) {
        fatal(&format!("creating {}: {}", data_dir.display(), e));
    }

    let cli_flag = matches.is_present("CLI");
    let watch_flag = matches.is_present("WATCH");
    let init_flag = matches.is_present("INITIALIZE");
    let server_flag = matches.is_present("SERVER");

    // The workspace owns the terminal, so its log goes to a file instead.
    if cli_flag {
        let log_file = File::create(data_dir.join("espore.log"))
            .unwrap_or_else(|e| fatal(&format!("creating log file: {}", e)));
        WriteLogger::init(log_level, Config::default(), log_file).unwrap();
    } else {
        TermLogger::init(log_level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto).unwrap();
    }

    trace!("{:#?}", matches);

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style("baud-rate").cyan()
        );
        process::exit(1);
    });

    let server_config = fwserver::Config {
        port: 8080,
        base: Path::new(&config.build.output).to_path_buf(),
    };
    if server_flag && !(cli_flag || watch_flag || init_flag) {
        if let Err(e) = fwserver::serve(&server_config) {
            fatal(&e.to_string());
        }
        return;
    }
    if server_flag {
        thread::spawn(move || {
            if let Err(e) = fwserver::serve(&server_config) {
                log::error!("firmware server: {}", e);
            }
        });
    }

    if cli_flag {
        let session = open_serial_session(matches.value_of("DEVICE_TTY"), baud_rate);
        let history = History::with_file(&data_dir.join("history.txt"), cli::HISTORY_LIMIT)
            .unwrap_or_else(|e| fatal(&format!("reading history: {}", e)));
        let result = cli::run(cli::Config {
            session,
            espore_config: config,
            history,
        });
        if let Err(e) = result {
            fatal(&format!("workspace: {}", e));
        }
        return;
    }

    if let Err(e) = builder::build(&config.build) {
        fatal(&e.to_string());
    }

    if init_flag {
        let session = open_serial_session(matches.value_of("DEVICE_TTY"), baud_rate);
        let result = initializer::initialize(Path::new(&config.build.output), &session);
        session.close();
        if let Err(e) = result {
            fatal(&format!("initializing device: {}", e));
        }
        println!("[espore] 👍 device initialized");
    }

    if watch_flag {
        watch(&config);
    }

    debug!("exit code: 0");
}

fn fatal(message: &str) -> ! {
    println!("{} {}", style("[espore] 💥 error:").red(), message);
    process::exit(1);
}

fn open_serial_session(tty: Option<&str>, baud_rate: u32) -> Arc<Session> {
    let mut builder = SettingsBuilder::new().baud_rate(baud_rate);
    if let Some(tty) = tty {
        builder = builder.path(tty);
    }
    let mut settings = builder.finalize();
    if !Path::new(&settings.path).exists() {
        match utils::select_port() {
            Some(port) => settings.path = port,
            None => fatal(&format!("serial device {} is not present", settings.path)),
        }
    }
    match Session::open(&settings) {
        Ok(session) => Arc::new(session),
        Err(e) => fatal(&format!("opening session over serial: {}", e)),
    }
}

/// Keep rebuilding while the configured library and device directories
/// change.
fn watch(config: &EsporeConfig) {
    let (tx, rx) = mpsc::channel();
    let mut w = watcher(tx, Duration::from_millis(100))
        .unwrap_or_else(|e| fatal(&format!("starting watcher: {}", e)));

    let mut watched = 0usize;
    for pattern in config.build.libs.iter().chain(config.build.devices.iter()) {
        for path in utils::expand_path_glob(pattern) {
            if path.is_dir() && w.watch(&path, RecursiveMode::Recursive).is_ok() {
                watched += 1;
            }
        }
    }
    if watched == 0 {
        fatal("nothing to watch; check the libs/devices globs in espore.json");
    }

    println!("[espore] 👀 Watching {} directories for changes...", watched);
    loop {
        match rx.recv() {
            Ok(
                DebouncedEvent::Create(path)
                | DebouncedEvent::Write(path)
                | DebouncedEvent::Remove(path)
                | DebouncedEvent::Rename(_, path),
            ) => {
                println!("[espore] {} changed", path.display());
                match builder::build(&config.build) {
                    Ok(()) => println!("[espore] done"),
                    Err(e) => println!("{} {}", style("[espore] 💥 build failed:").red(), e),
                }
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}
