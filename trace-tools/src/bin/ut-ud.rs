use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use std::fs;
use std::io::{self, BufWriter};

use trace::Trace;
use ud::{Mode, NullDisasm, UdGraph};

/// Performs use-def analysis on a trace.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input trace file.
    #[arg(short, long, default_value_t = String::from("trace.out"))]
    input: String,

    /// Binary analysis output files, named with a {} placeholder.
    #[arg(long, default_value_t = String::from("ud-{}.bin"))]
    ud: String,

    /// Write the graph in DOT format into this file.
    #[arg(long)]
    dot: Option<String>,

    /// Write the graph in HTML format into this file.
    #[arg(long)]
    html: Option<String>,

    /// Write code, trace and uses CSV files named with a {} placeholder.
    #[arg(long)]
    csv: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("UT_LOG"))
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();

    let trace = Trace::load(&args.input)?;
    let mut graph = UdGraph::build(&trace, &args.ud, Mode::Create, Box::new(NullDisasm))?;
    eprintln!(
        "{} dynamic instructions over {} static instructions",
        graph.trace_len(),
        graph.code_len()
    );

    if let Some(path) = args.dot.as_deref() {
        let mut out = BufWriter::new(fs::File::create(path)?);
        graph.dump_dot(&mut out)?;
    }
    if let Some(path) = args.html.as_deref() {
        let mut out = BufWriter::new(fs::File::create(path)?);
        graph.dump_html(&mut out)?;
    }
    if let Some(template) = args.csv.as_deref() {
        graph.dump_csv(template)?;
    }
    Ok(())
}
