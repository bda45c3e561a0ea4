//! The `ddcci` command-line tool.

use {
    clap::{Parser, Subcommand},
    ddcci::{
        display::{DdcFlags, DISPNO_PHANTOM},
        Context, DdcResult, Error, Query, Status,
    },
    log::debug,
    std::{
        io::Write as _,
        path::{Path, PathBuf},
        process::ExitCode,
        time::Duration,
    },
};

/// Features written by `dumpvcp` when the monitor publishes no
/// capabilities string: brightness, contrast, color preset and RGB gains.
const PROFILE_FEATURES: &[u8] = &[0x10, 0x12, 0x14, 0x16, 0x18, 0x1A];

/// How long to wait for a display that another process is using.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "ddcci", version, about = "Query and set monitor settings over DDC/CI")]
struct Cli {
    /// Select the display on I2C bus N
    #[arg(short = 'b', long, global = true)]
    bus: Option<u32>,

    /// Select the display by display number
    #[arg(short = 'd', long, global = true)]
    display: Option<i32>,

    /// Select the display whose EDID starts with the given hex bytes
    #[arg(long, global = true)]
    edid: Option<String>,

    /// Select the display by manufacturer id
    #[arg(long, global = true)]
    mfg: Option<String>,

    /// Select the display by model name
    #[arg(long, global = true)]
    model: Option<String>,

    /// Select the display by serial number
    #[arg(long, global = true)]
    sn: Option<String>,

    /// Skip read-back verification after setvcp
    #[arg(long, global = true)]
    noverify: bool,

    /// Extra library options, e.g. "--maxtries 4,6,8 --sleep-multiplier 2"
    #[arg(long, global = true, default_value = "", hide_default_value = true)]
    lib_options: String,

    /// Print execution statistics on exit
    #[arg(long, global = true)]
    stats: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the detected displays
    Detect,
    /// Get the value of one or more VCP features (hex feature codes)
    Getvcp {
        /// Feature codes, e.g. 10 or 0xE1
        #[arg(required = true)]
        features: Vec<String>,
    },
    /// Set a VCP feature
    Setvcp {
        /// Feature code, e.g. 10
        feature: String,
        /// New value
        value: u16,
    },
    /// Show the display's capabilities
    Capabilities,
    /// Write the display's current feature values to a profile file
    Dumpvcp {
        /// Output file; standard output when omitted
        file: Option<PathBuf>,
    },
    /// Restore feature values from a profile file
    Loadvcp {
        /// Profile file written by dumpvcp
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let ctx = match Context::new(&cli.lib_options) {
        Ok(ctx) => ctx,
        Err(err) => return report(&err),
    };

    let res = run(&ctx, &cli);

    if cli.stats {
        print!("{}", ctx.stats().report());
    }
    if let Err(err) = ctx.teardown() {
        debug!("teardown: {}", err);
    }

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn report(err: &Error) -> ExitCode {
    eprintln!("ddcci: {}", err);
    for cause in &err.causes {
        eprint!("{}", indent(&cause.render_tree()));
    }
    ExitCode::from(exit_code(err.status))
}

fn indent(tree: &str) -> String {
    tree.lines().map(|l| format!("  {}\n", l)).collect()
}

/// Encode the dominant error kind in the exit code.
fn exit_code(status: Status) -> u8 {
    match status {
        Status::DisplayNotFound | Status::DisplayRemoved => 2,
        Status::ReportedUnsupported | Status::DeterminedUnsupported => 3,
        Status::DisplayBusy => 4,
        Status::BadConfiguration | Status::InvalidArgument => 5,
        _ => 1,
    }
}

fn run(ctx: &Context, cli: &Cli) -> DdcResult<()> {
    match &cli.command {
        Command::Detect => detect(ctx),
        Command::Getvcp { features } => {
            let mut handle = ctx.open_display(&selection(cli)?, Some(LOCK_TIMEOUT))?;
            for feature in features {
                let code = parse_feature(feature)?;
                match handle.get_vcp_feature(code) {
                    Ok(value) => println!(
                        "VCP {:02X}: current {}, max {}",
                        code,
                        value.value(),
                        value.maximum()
                    ),
                    Err(err)
                        if matches!(
                            err.status,
                            Status::ReportedUnsupported | Status::DeterminedUnsupported
                        ) =>
                    {
                        println!("VCP {:02X}: unsupported ({})", code, err.status)
                    },
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        },
        Command::Setvcp { feature, value } => {
            let mut handle = ctx.open_display(&selection(cli)?, Some(LOCK_TIMEOUT))?;
            handle.set_verification(!cli.noverify);
            handle.set_vcp_feature(parse_feature(feature)?, *value)
        },
        Command::Capabilities => {
            let mut handle = ctx.open_display(&selection(cli)?, Some(LOCK_TIMEOUT))?;
            let raw = ctx.capabilities_string(&mut handle)?;
            let caps = ddcci::caps::parse_capabilities(&raw)?;
            if let Some(model) = &caps.model {
                println!("Model: {}", model);
            }
            if let Some((major, minor)) = caps.mccs_version {
                println!("MCCS version: {}.{}", major, minor);
            }
            println!("VCP features:");
            for (code, values) in &caps.vcp {
                match values {
                    None => println!("   {:02X}: continuous", code),
                    Some(values) => println!(
                        "   {:02X}: {}",
                        code,
                        values
                            .iter()
                            .map(|v| format!("{:02X}", v))
                            .collect::<Vec<_>>()
                            .join(" ")
                    ),
                }
            }
            for defect in &caps.defects {
                println!("   (unparsed at byte {}: {})", defect.offset, defect.message);
            }
            Ok(())
        },
        Command::Dumpvcp { file } => dumpvcp(ctx, cli, file.as_deref()),
        Command::Loadvcp { file } => loadvcp(ctx, file),
    }
}

fn detect(ctx: &Context) -> DdcResult<()> {
    for rec in ctx.displays() {
        let display = &rec.display;
        let flags = rec.flags();
        if display.dispno > 0 {
            println!("Display {}", display.dispno);
        } else if display.dispno == DISPNO_PHANTOM {
            println!(
                "Phantom display (shadows display {})",
                display.phantom_of.unwrap_or(0)
            );
        } else if flags.contains(DdcFlags::BUSY) {
            println!("Busy display");
        } else {
            println!("Invalid display");
        }
        println!("   I/O path:     {}", display.path);
        if let Some(mfg) = &display.info.manufacturer_id {
            println!("   Manufacturer: {}", mfg);
        }
        if let Some(model) = &display.info.model_name {
            println!("   Model:        {}", model);
        } else if let Some(code) = display.info.product_code {
            println!("   Product code: {}", code);
        }
        if let Some(sn) = &display.info.serial_number {
            println!("   Serial:       {}", sn);
        }
        if display.dispno > 0 {
            println!("   Dialect:      {}", dialect_name(flags));
            println!("   Multiplier:   {:.2}", rec.sleep_multiplier());
        }
    }
    if ctx.displays().is_empty() {
        println!("No DDC/CI capable displays found");
    }
    Ok(())
}

fn dialect_name(flags: DdcFlags) -> &'static str {
    if flags.contains(DdcFlags::USES_DDC_FLAG) {
        "unsupported reported in reply"
    } else if flags.contains(DdcFlags::USES_NULL_RESPONSE) {
        "unsupported signalled by null response"
    } else if flags.contains(DdcFlags::USES_ALL_ZERO_BYTES) {
        "unsupported signalled by all-zero values"
    } else {
        "does not indicate unsupported"
    }
}

fn dumpvcp(ctx: &Context, cli: &Cli, file: Option<&Path>) -> DdcResult<()> {
    let mut handle = ctx.open_display(&selection(cli)?, Some(LOCK_TIMEOUT))?;

    // prefer the monitor's own feature list
    let features: Vec<u8> = match ctx
        .capabilities_string(&mut handle)
        .and_then(|raw| ddcci::caps::parse_capabilities(&raw))
    {
        Ok(caps) if !caps.vcp.is_empty() => caps.vcp.keys().copied().collect(),
        _ => {
            debug!("no usable capabilities, dumping the standard profile features");
            PROFILE_FEATURES.to_vec()
        },
    };

    let info = handle.display().info.clone();
    let mut out = String::new();
    out.push_str("DDCCI profile 1\n");
    if let Some(mfg) = &info.manufacturer_id {
        out.push_str(&format!("MFG {}\n", mfg));
    }
    if let Some(model) = &info.model_name {
        out.push_str(&format!("MODEL {}\n", model));
    }
    if let Some(sn) = &info.serial_number {
        out.push_str(&format!("SN {}\n", sn));
    }
    for code in features {
        match handle.get_vcp_feature(code) {
            Ok(value) => out.push_str(&format!("VCP {:02X} {}\n", code, value.value())),
            Err(err)
                if matches!(
                    err.status,
                    Status::ReportedUnsupported | Status::DeterminedUnsupported
                ) =>
            {
                debug!("skipping unsupported feature x{:02X}", code)
            },
            Err(err) => return Err(err),
        }
    }

    match file {
        Some(path) => std::fs::write(path, out).map_err(|e| {
            Error::new(
                Status::InvalidArgument,
                "cli::dumpvcp",
                format!("write {}: {}", path.display(), e),
            )
        }),
        None => {
            print!("{}", out);
            std::io::stdout().flush().ok();
            Ok(())
        },
    }
}

fn loadvcp(ctx: &Context, file: &Path) -> DdcResult<()> {
    const SITE: &str = "cli::loadvcp";
    let text = std::fs::read_to_string(file).map_err(|e| {
        Error::new(
            Status::BadConfiguration,
            SITE,
            format!("read {}: {}", file.display(), e),
        )
    })?;

    let mut terms = Vec::new();
    let mut settings = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("DDCCI profile") {
            continue;
        }
        let bad = || {
            Error::new(
                Status::BadConfiguration,
                SITE,
                format!("{}:{}: unparseable line", file.display(), lineno + 1),
            )
        };
        let (key, rest) = line.split_once(' ').ok_or_else(bad)?;
        match key {
            "MFG" => terms.push(Query::ManufacturerId(rest.to_string())),
            "MODEL" => terms.push(Query::ModelName(rest.to_string())),
            "SN" => terms.push(Query::SerialNumber(rest.to_string())),
            "VCP" => {
                let (code, value) = rest.split_once(' ').ok_or_else(bad)?;
                settings.push((
                    parse_feature(code).map_err(|_| bad())?,
                    value.parse::<u16>().map_err(|_| bad())?,
                ));
            },
            _ => return Err(bad()),
        }
    }
    if terms.is_empty() {
        return Err(Error::new(
            Status::BadConfiguration,
            SITE,
            format!("{} names no display identity", file.display()),
        ));
    }

    let mut handle = ctx.open_display(&Query::And(terms), Some(LOCK_TIMEOUT))?;
    for (code, value) in settings {
        handle.set_vcp_feature(code, value)?;
    }
    Ok(())
}

fn selection(cli: &Cli) -> DdcResult<Query> {
    let mut terms = Vec::new();
    if let Some(bus) = cli.bus {
        terms.push(Query::Bus(bus));
    }
    if let Some(display) = cli.display {
        terms.push(Query::DisplayNumber(display));
    }
    if let Some(edid) = &cli.edid {
        terms.push(Query::EdidPrefix(parse_hex_string(edid)?));
    }
    if let Some(mfg) = &cli.mfg {
        terms.push(Query::ManufacturerId(mfg.clone()));
    }
    if let Some(model) = &cli.model {
        terms.push(Query::ModelName(model.clone()));
    }
    if let Some(sn) = &cli.sn {
        terms.push(Query::SerialNumber(sn.clone()));
    }
    Ok(match terms.len() {
        0 => Query::Any,
        1 => terms.pop().unwrap_or(Query::Any),
        _ => Query::And(terms),
    })
}

fn parse_feature(s: &str) -> DdcResult<u8> {
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u8::from_str_radix(hex, 16).map_err(|_| {
        Error::new(
            Status::InvalidArgument,
            "cli::parse_feature",
            format!("{} is not a hex feature code", s),
        )
    })
}

fn parse_hex_string(s: &str) -> DdcResult<Vec<u8>> {
    let clean: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.len() % 2 != 0 || clean.is_empty() {
        return Err(Error::new(
            Status::InvalidArgument,
            "cli::parse_hex",
            format!("{} is not an even-length hex string", s),
        ));
    }
    (0..clean.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&clean[i..i + 2], 16).map_err(|_| {
                Error::new(
                    Status::InvalidArgument,
                    "cli::parse_hex",
                    format!("{} is not a hex string", s),
                )
            })
        })
        .collect()
}
