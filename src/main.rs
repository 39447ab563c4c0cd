use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kid_readout::acquire::{self, FilterbankBinScan, HeaterSweepAndStream};
use kid_readout::adapters::SerialAdapter;
use kid_readout::analysis::analyze_directory;
use kid_readout::config::Settings;
use kid_readout::instrument::{
    load_curve, save_curve, Agilent33220, DcSource, Sim900, SimThermometer, SimulatedDcSource,
};
use kid_readout::logging::{self, LogFormat};
use kid_readout::measurement::State;
use kid_readout::readout::{calculate, Readout, RoachState, SimulatedReadout};
use kid_readout::storage::{write_records_csv, TemperatureLog};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "KID readout acquisition and analysis", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = kid_readout::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Use the simulated readout and heater instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep and stream resonators at each heater voltage and DAC attenuation
    SweepStream(SweepStreamArgs),
    /// Step one tone across a filter bank channel
    FilterbankBin(FilterbankBinArgs),
    /// Noise analysis of a data directory
    Analyze(AnalyzeArgs),
    /// Read the resistance bridge
    Temperature,
    /// Thermometer calibration curves stored in a SIM module
    #[command(subcommand)]
    Curve(CurveCommand),
}

#[derive(Args, Debug)]
struct SweepStreamArgs {
    /// Resonance frequencies in MHz
    #[arg(long, value_delimiter = ',', required = true)]
    f0s: Vec<f64>,
    /// Heater voltages in V
    #[arg(long, value_delimiter = ',', default_value = "0")]
    voltages: Vec<f64>,
    /// DAC attenuations in dB
    #[arg(long, value_delimiter = ',', default_value = "10")]
    attenuations: Vec<f64>,
    #[arg(long, default_value_t = 4)]
    tones_at_once: usize,
    /// LO frequency in MHz (heterodyne readouts)
    #[arg(long)]
    lo: Option<f64>,
    #[arg(long, default_value_t = 6)]
    fft_gain: u32,
    /// Sweep half-width in tone bins
    #[arg(long, default_value_t = 256)]
    half_width_bins: i64,
    #[arg(long, default_value_t = 60.0)]
    settle_seconds: f64,
    #[arg(long, default_value_t = 60.0)]
    stream_seconds: f64,
}

#[derive(Args, Debug)]
struct FilterbankBinArgs {
    #[arg(long, default_value_t = 100.0)]
    baseband_mhz: f64,
    #[arg(long)]
    lo: Option<f64>,
    #[arg(long, default_value_t = 10.0)]
    attenuation: f64,
    #[arg(long, default_value_t = 5)]
    tones_per_bin_exponent: u32,
    #[arg(long, default_value_t = 3)]
    half_width_bins: i64,
    #[arg(long, default_value_t = 1)]
    blocks: usize,
    #[arg(long, default_value_t = 5.0)]
    wait_seconds: f64,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Data directory to analyze
    directory: PathBuf,
    /// Write the noise summaries here as CSV
    #[arg(long)]
    summary_csv: Option<PathBuf>,
    /// Write the per-channel sweep-stream records here as CSV
    #[arg(long)]
    records_csv: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Module {
    Sim921,
    Sim922,
}

#[derive(Args, Debug)]
struct CurveTarget {
    #[arg(long, value_enum, default_value_t = Module::Sim921)]
    module: Module,
    /// SIM900 port holding the module; defaults to the configured bridge slot
    #[arg(long)]
    slot: Option<char>,
    /// Curve number (SIM921) or channel (SIM922)
    #[arg(long)]
    number: u8,
}

#[derive(Subcommand, Debug)]
enum CurveCommand {
    /// Read a stored curve and save it as `<ID>.txt`
    Read {
        #[command(flatten)]
        target: CurveTarget,
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },
    /// Write a two-column curve file into the module
    Write {
        #[command(flatten)]
        target: CurveTarget,
        file: PathBuf,
        #[arg(long, default_value = "0")]
        format: String,
    },
    /// Compare a curve file with the stored curve
    Validate {
        #[command(flatten)]
        target: CurveTarget,
        file: PathBuf,
        #[arg(long, default_value = "0")]
        format: String,
    },
}

fn simulated_readout(settings: &Settings, simulate: bool) -> Result<SimulatedReadout> {
    if !simulate {
        bail!("No hardware readout is available in this build; run with --simulate");
    }
    Ok(SimulatedReadout::new(&settings.readout))
}

async fn heater_source(settings: &Settings, simulate: bool) -> Result<Box<dyn DcSource>> {
    if simulate {
        return Ok(Box::new(SimulatedDcSource::default()));
    }
    let Some(config) = &settings.instruments.function_generator else {
        bail!("No function generator configured under [instruments.function_generator]");
    };
    Ok(Box::new(Agilent33220::connect(config).await?))
}

async fn mainframe(settings: &Settings) -> Result<(Sim900<SerialAdapter>, char)> {
    let Some(config) = &settings.instruments.sim900 else {
        bail!("No SIM900 configured under [instruments.sim900]");
    };
    let mut adapter = SerialAdapter::from_config(config);
    adapter
        .connect()
        .await
        .with_context(|| format!("Failed to open SIM900 on {}", config.port))?;
    let mut sim900 = Sim900::new(adapter);
    sim900.initialize(false).await?;
    Ok((sim900, config.bridge_slot))
}

async fn sweep_stream(settings: &Settings, simulate: bool, args: SweepStreamArgs) -> Result<()> {
    let mut readout = simulated_readout(settings, simulate)?;
    let mut source = heater_source(settings, simulate).await?;
    let nsamp = settings.readout.num_tone_samples;
    let state = RoachState {
        num_tone_samples: nsamp,
        ..readout.roach_state()
    };
    let bin_mhz = calculate::baseband_frequency(&state, 1) * 1e-6;
    let offsets_mhz = (-args.half_width_bins..args.half_width_bins)
        .map(|k| k as f64 * bin_mhz)
        .collect();
    let procedure = HeaterSweepAndStream {
        initial_f0s_mhz: args.f0s,
        tones_at_once: args.tones_at_once,
        lo_mhz: args.lo,
        fft_gain: args.fft_gain,
        num_tone_samples: nsamp,
        offsets_mhz,
        heater_voltages: args.voltages,
        dac_attenuations: args.attenuations,
        settle: Duration::from_secs_f64(args.settle_seconds.max(0.0)),
        stream_seconds: args.stream_seconds,
        max_f0_shift_hz: settings.analysis.max_f0_shift_hz,
        min_tone_spacing_mhz: settings.analysis.min_tone_spacing_mhz,
        data_dir: settings.storage.data_dir.clone(),
        cryostat: settings.cryostat.name.clone(),
    };
    let state = State::new().with("cryostat", settings.cryostat.name.clone());
    let paths = procedure.run(&mut readout, source.as_mut(), &state).await?;
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}

async fn filterbank_bin(settings: &Settings, simulate: bool, args: FilterbankBinArgs) -> Result<()> {
    let mut readout = simulated_readout(settings, simulate)?;
    let scan = FilterbankBinScan {
        lo_mhz: args.lo,
        baseband_mhz: args.baseband_mhz,
        dac_attenuation: args.attenuation,
        tones_per_bin_exponent: args.tones_per_bin_exponent,
        half_width_in_bins: args.half_width_bins,
        stream_length_blocks: args.blocks,
        wait: Duration::from_secs_f64(args.wait_seconds.max(0.0)),
        data_dir: settings.storage.data_dir.clone(),
        cryostat: settings.cryostat.name.clone(),
    };
    let path = scan.run(&mut readout, &State::new()).await?;
    println!("{}", path.display());
    Ok(())
}

fn analyze(settings: &Settings, args: AnalyzeArgs) -> Result<()> {
    let temperatures = match &settings.storage.temperature_log_dir {
        Some(dir) => Some(TemperatureLog::load_dir(dir).context("Failed to load temperature logs")?),
        None => None,
    };
    let analysis = analyze_directory(&args.directory, settings, temperatures.as_ref())?;
    for summary in &analysis.summaries {
        println!("{}", serde_json::to_string(summary)?);
    }
    if let Some(path) = &args.summary_csv {
        write_records_csv(path, &analysis.summary_table())?;
    }
    if let Some(path) = &args.records_csv {
        write_records_csv(path, &analysis.records)?;
    }
    Ok(())
}

async fn temperature(settings: &Settings) -> Result<()> {
    let (mut sim900, slot) = mainframe(settings).await?;
    let mut bridge = sim900.sim921(slot);
    let kelvin = bridge.temperature().await?;
    let ohms = bridge.resistance().await?;
    info!(kelvin, ohms, "bridge reading");
    println!("{kelvin}\t{ohms}");
    Ok(())
}

async fn curve<T: SimThermometer>(thermometer: &mut T, command: &CurveCommand) -> Result<()> {
    match command {
        CurveCommand::Read { target, output } => {
            let curve = thermometer.read_curve(target.number).await?;
            let path = save_curve(output, &curve)?;
            println!("{}", path.display());
        }
        CurveCommand::Write { target, file, format } => {
            let curve = load_curve(file, format)?;
            thermometer.write_curve(target.number, &curve).await?;
        }
        CurveCommand::Validate { target, file, format } => {
            let curve = load_curve(file, format)?;
            if !thermometer.validate_curve(target.number, &curve).await? {
                bail!("Stored curve {} differs from {}", target.number, file.display());
            }
            println!("curve {} matches", target.number);
        }
    }
    Ok(())
}

async fn curve_command(settings: &Settings, command: CurveCommand) -> Result<()> {
    let target = match &command {
        CurveCommand::Read { target, .. }
        | CurveCommand::Write { target, .. }
        | CurveCommand::Validate { target, .. } => target,
    };
    let (mut sim900, bridge_slot) = mainframe(settings).await?;
    let slot = target.slot.unwrap_or(bridge_slot);
    match target.module {
        Module::Sim921 => curve(&mut sim900.sim921(slot), &command).await,
        Module::Sim922 => curve(&mut sim900.sim922(slot), &command).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    logging::init(&settings, format);
    acquire::log_settings(&settings);

    match cli.command {
        Command::SweepStream(args) => sweep_stream(&settings, cli.simulate, args).await,
        Command::FilterbankBin(args) => filterbank_bin(&settings, cli.simulate, args).await,
        Command::Analyze(args) => analyze(&settings, args),
        Command::Temperature => temperature(&settings).await,
        Command::Curve(command) => curve_command(&settings, command).await,
    }
}
