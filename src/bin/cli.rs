//! Bootlab command line interface.

use std::{fs::File, process};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use log::{debug, trace, LevelFilter};
use simplelog::*;

use bootlab::{
    BootRequest, DeployRequest, DeviceConfig, FactoryParams, KernelFormat, NoPower, Outcome,
    ReplayConnector, ReplayScript, Target,
};

fn main() {
    println!("[BL] bootlab v{}", crate_version!());

    if let Err(err) = ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(130);
    }) {
        eprintln!("could not install the Ctrl-C handler: {}", err);
    }

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Bootlab takes a lab set-top box through its bootloader over the \
            serial or telnet console, flashes the given image along with the \
            factory data, follows the kernel boot and prepares the booted \
            Android for tests.\n\
            \n\
            The device is described by a TOML configuration file: its family \
            (mstar, mstar-938 or hisi), its console, its prompts and timeouts, \
            its power switch and its named boot command sequences.\n\
            \n\
            Every step is recorded as a test result, printed at the end and \
            optionally written as JSON.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("CONFIG")
                .help("the device configuration file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("IMAGE")
                .help("image path on the image server")
                .long_help(
                    "image path on the image server, relative to its TFTP \
                     root; the image directory also holds the mboot and \
                     fastboot scripts.",
                )
                .short("-i")
                .long("--image")
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("IMAGE_SERVER_IP")
                .help("TFTP server holding the image")
                .long("--image-server-ip")
                .takes_value(true)
                .default_value("127.0.0.1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BOOTLOADER_TYPE")
                .help("bootloader of the device")
                .long("--bootloader-type")
                .takes_value(true)
                .possible_values(&["u_boot", "ipxe", "uefi"])
                .default_value("u_boot")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("KERNEL_FORMAT")
                .help("kernel image format, selects the load addresses")
                .long("--kernel-format")
                .takes_value(true)
                .possible_values(&["uImage", "zImage"])
                .default_value("uImage")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SKIP")
                .help("take the device as already booted")
                .long("--skip"),
        )
        .arg(
            Arg::with_name("EMMC")
                .help("provision the EMMC and dump it to the USB disk")
                .long("--emmc")
                .conflicts_with("SKIP"),
        )
        .arg(
            Arg::with_name("BOOT_OPTION")
                .help("named boot command sequence to use")
                .long("--boot-option")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("JOB_ID")
                .help("job id, names the factory image")
                .long("--job-id")
                .takes_value(true)
                .default_value("0")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PROJECT")
                .help("project the factory image is built for")
                .long("--project")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("MODEL_INDEX")
                .help("panel model index")
                .long("--model-index")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PRODUCT")
                .help("product name")
                .long("--product")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("YUN_OS")
                .help("build a YunOS factory image")
                .long("--yun-os"),
        )
        .arg(
            Arg::with_name("REPLAY")
                .help("replay a scripted console instead of the device")
                .long_help(
                    "replay a scripted console instead of the device; the \
                     TOML script lists the replies to send for each line \
                     matching a pattern. The power switch is disabled.",
                )
                .long("--replay")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("RESULTS")
                .help("write the results as JSON to this file")
                .long("--results")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LOG_FILE")
                .help("also write the log to this file")
                .long("--log-file")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'bootlab -v -v -v' or 'bootlab -vvv' vs 'bootlab -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    init_logging(log_level, matches.value_of("LOG_FILE"));

    trace!("{:#?}", matches);

    // It's safe to call unwrap on all command line arguments that are required
    // or have default values.
    let config_path = matches.value_of("CONFIG").unwrap();
    let config = DeviceConfig::load(config_path)
        .unwrap_or_else(|err| fail(&format!("cannot load `{}`", config_path), &err));

    let mut target =
        Target::new(config).unwrap_or_else(|err| fail("cannot set up the target", &err));
    if let Some(script) = matches.value_of("REPLAY") {
        let connector = ReplayScript::load(script)
            .and_then(ReplayConnector::new)
            .unwrap_or_else(|err| fail(&format!("cannot load `{}`", script), &err));
        target = target.with_connector(connector).with_power(NoPower);
    }

    let deploy = deploy_request(&matches);
    let boot = BootRequest {
        skip: matches.is_present("SKIP"),
        emmc: matches.is_present("EMMC"),
        boot_option: matches.value_of("BOOT_OPTION").map(str::to_owned),
        ..BootRequest::default()
    };

    // Run the job =============================================================

    let outcome = target.deploy_and_boot(deploy, boot);
    print_results(&target);

    if let Some(path) = matches.value_of("RESULTS") {
        let written = target
            .results()
            .to_json()
            .map_err(|err| err.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|err| err.to_string()));
        if let Err(err) = written {
            println!("{}: cannot write `{}`: {}", style("error").red(), path, err);
        }
    }

    let exit_code = match outcome {
        Ok(()) => {
            println!("{} {}", style("==>").cyan(), style(target.state()).green());
            0
        }
        Err(err) => {
            println!(
                "{} {}: {}",
                style("==>").cyan(),
                style(target.state()).red(),
                err
            );
            1
        }
    };
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn init_logging(level: LevelFilter, log_file: Option<&str>) {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        match File::create(path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(err) => println!(
                "{}: cannot create log file `{}`: {}",
                style("warning").yellow(),
                path,
                err
            ),
        }
    }
    if let Err(err) = CombinedLogger::init(loggers) {
        println!("{}: {}", style("warning").yellow(), err);
    }
}

fn deploy_request(matches: &ArgMatches) -> DeployRequest {
    let mut request = DeployRequest::new(
        matches.value_of("IMAGE").unwrap(),
        matches.value_of("IMAGE_SERVER_IP").unwrap(),
    );
    request.bootloader_type = matches.value_of("BOOTLOADER_TYPE").unwrap().into();
    request.kernel_format = match matches.value_of("KERNEL_FORMAT").unwrap() {
        "uImage" => KernelFormat::UImage,
        "zImage" => KernelFormat::ZImage,
        _ => unreachable!(),
    };
    request.factory = FactoryParams {
        job_id: matches.value_of("JOB_ID").unwrap().into(),
        project_name: matches.value_of("PROJECT").unwrap_or_default().into(),
        model_index: matches.value_of("MODEL_INDEX").unwrap_or_default().into(),
        product_name: matches.value_of("PRODUCT").unwrap_or_default().into(),
        yun_os: matches.is_present("YUN_OS"),
    };
    request
}

fn print_results(target: &Target) {
    let results = target.results();
    if results.is_empty() {
        return;
    }
    println!();
    for result in results.iter() {
        let outcome = match result.result {
            Outcome::Pass => style(result.result).green(),
            Outcome::Fail => style(result.result).red(),
            Outcome::Skip => style(result.result).yellow(),
        };
        let measurement = match (result.measurement, &result.units) {
            (Some(value), Some(units)) => format!("{:.2} {}", value, units),
            (Some(value), None) => format!("{:.2}", value),
            _ => String::new(),
        };
        println!(
            "  {:<40} {:<6} {}",
            result.test_case_id, outcome, measurement
        );
        if let Some(message) = &result.message {
            println!("    {} {}", style("-->").cyan(), message);
        }
    }
    println!(
        "\n  {} results, {} failed\n",
        results.len(),
        style(results.failures()).bold()
    );
}

fn fail(context: &str, err: &bootlab::Error) -> ! {
    println!("{}: {}", style("error").red(), context);
    println!("   {} {}", style("-->").cyan(), err);
    process::exit(-1);
}
