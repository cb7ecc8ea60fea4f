use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::{ArgAction, Parser};
use env_logger::Env;
use num_format::{Buffer, Locale};
use pyroscope_storage::call_tree::CallTree;
use pyroscope_storage::folded::{self, FrameDict, Options};
use pyroscope_storage::segment::{AggregationType, Key, Units};
use pyroscope_storage::storage::{Config, GetInput, MemoryStore, PutInput, Storage};

#[derive(Debug, Parser)]
#[clap(
    name = "pyroscope-fold",
    about,
    after_help = "\
Every input file is stored as one profile of --interval seconds, the first one starting at
--from and each following one right after the previous. The merged profile of the queried
range is printed as folded stacks.
    "
)]
struct Opt {
    // *************** //
    // *** OPTIONS *** //
    // *************** //
    /// Application the profiles belong to, e.g. "my.app.cpu{env=prod}"
    #[clap(long = "app", value_name = "KEY", default_value = "app.cpu")]
    app: String,

    /// Start of the first profile, in unix seconds [default: now]
    #[clap(long = "from", value_name = "SECONDS")]
    from: Option<i64>,

    /// Length of every profile, in seconds
    #[clap(
        long = "interval",
        value_name = "SECONDS",
        default_value = "10",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    interval: u32,

    /// Start of the queried range, in unix seconds [default: start of the first profile]
    #[clap(long = "query-from", value_name = "SECONDS")]
    query_from: Option<i64>,

    /// End of the queried range, in unix seconds [default: end of the last profile]
    #[clap(long = "query-until", value_name = "SECONDS")]
    query_until: Option<i64>,

    /// Keep only about this many nodes of the merged profile; 0 keeps all of them
    #[clap(long = "max-nodes", value_name = "COUNT", default_value = "0")]
    max_nodes: usize,

    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// Strip hex numbers (addresses)
    #[clap(short = 's', long = "strip-hex")]
    strip_hex: bool,

    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Folded stack files, one profile each, or STDIN if not specified
    #[clap(value_name = "PATH")]
    infiles: Vec<PathBuf>,
}

fn invalid_input<E: ToString>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

fn formatted(n: u64) -> String {
    let mut buf = Buffer::default();
    buf.write_formatted(&n, &Locale::en);
    buf.as_str().to_string()
}

fn timestamp(secs: i64) -> io::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| invalid_input(format!("timestamp {} is out of range", secs)))
}

fn read_profiles(opt: &Opt, dict: &mut FrameDict) -> io::Result<Vec<CallTree>> {
    let options = Options {
        strip_hex: opt.strip_hex,
    };
    if opt.infiles.is_empty() {
        let mut tree = CallTree::new(0);
        folded::from_reader(&options, io::stdin().lock(), dict, &mut tree)?;
        return Ok(vec![tree]);
    }

    let mut profiles = Vec::with_capacity(opt.infiles.len());
    for infile in &opt.infiles {
        let mut tree = CallTree::new(0);
        let ignored = folded::from_files(&options, &[infile], dict, &mut tree)?;
        if ignored > 0 {
            log::warn!("{}: ignored {} lines", infile.display(), ignored);
        }
        profiles.push(tree);
    }
    Ok(profiles)
}

fn main() -> io::Result<()> {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    let key = Key::parse(&opt.app).map_err(invalid_input)?;
    let from = match opt.from {
        Some(secs) => timestamp(secs)?,
        None => Utc::now(),
    };
    let interval = Duration::seconds(i64::from(opt.interval));

    let mut dict = FrameDict::new();
    let profiles = read_profiles(&opt, &mut dict)?;

    let storage =
        Storage::new(Config::default(), Arc::new(MemoryStore::new())).map_err(invalid_input)?;
    let (mut start, mut total) = (from, 0u64);
    let nprofiles = profiles.len();
    for tree in profiles {
        total += tree.total();
        storage
            .put(&PutInput {
                key: key.clone(),
                start_time: start,
                end_time: start + interval,
                tree,
                spy_name: "pyroscope-fold".to_string(),
                sample_rate: 100,
                units: Units::Samples,
                aggregation_type: AggregationType::Sum,
            })
            .map_err(invalid_input)?;
        start = start + interval;
    }
    log::info!("stored {} samples in {} profiles", formatted(total), nprofiles);

    let query_from = opt.query_from.map(timestamp).transpose()?.unwrap_or(from);
    let query_until = opt.query_until.map(timestamp).transpose()?.unwrap_or(start);
    let out = storage
        .get(&GetInput {
            key,
            start_time: query_from,
            end_time: query_until,
        })
        .map_err(invalid_input)?;

    let mut out = match out {
        Some(out) => out,
        None => {
            log::warn!("no data between {} and {}", query_from, query_until);
            return Ok(());
        }
    };
    if opt.max_nodes > 0 {
        out.tree.trim(opt.max_nodes);
    }
    log::info!("queried {} samples", formatted(out.tree.total()));

    let mut writer = io::BufWriter::new(io::stdout().lock());
    folded::write(&out.tree, &dict, &mut writer)?;
    writer.flush()
}
