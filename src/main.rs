mod addr;
mod assembler;
mod charreader;
mod fileman;
mod intern;
mod lexer;
mod listing;
mod object;
mod segment;
mod symtab;

use std::{fs::File, io, path::PathBuf, process};

use clap::Parser;

use crate::{
    assembler::{Assembler, Output},
    fileman::RealFileSystem,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to input assembly file
    #[clap(parse(from_os_str), value_name = "INPUT")]
    input: PathBuf,

    /// Additional include search directories
    #[clap(short = 'I', long = "include", parse(from_os_str), value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Object file path (defaults to INPUT with extension "o80")
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    output: Option<PathBuf>,

    /// Listing file path (defaults to INPUT with extension "lst")
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    listing: Option<PathBuf>,
}

fn write_outputs(args: &Args, output: &Output) -> io::Result<()> {
    let object_path = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("o80"));
    let listing_path = args
        .listing
        .clone()
        .unwrap_or_else(|| args.input.with_extension("lst"));

    let mut object_file = File::create(object_path)?;
    output.object.write(&mut object_file)?;

    let mut listing_file = File::create(listing_path)?;
    output.listing.write(&mut listing_file)?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let mut assembler = Assembler::new(RealFileSystem::new());
    for dir in &args.include {
        if let Err(e) = assembler.add_search_path(".", dir) {
            eprintln!("{e}");
            process::exit(1);
        }
    }

    let output = match assembler.assemble(".", &args.input) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    if let Err(e) = write_outputs(&args, &output) {
        eprintln!("Failed to write output: {e}");
        process::exit(1);
    }
}
