use std::{
    io::{
        BufWriter,
        Write,
    },
    path::PathBuf,
};

use clap::Parser;
use lyn::{
    load_object,
    parse_symbol_table,
    write_hook_events,
    Error,
    EventObject,
    Logger,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input ELF object files, merged in order
    #[arg(required = true)]
    objects: Vec<PathBuf>,

    /// External symbol table file, one `ADDRESS NAME` pair per line
    #[arg(short, long)]
    symbols: Option<PathBuf>,

    /// Leave all references unresolved and emit them symbolically
    #[arg(long)]
    no_link: bool,

    /// Only resolve references against the external symbol table
    #[arg(long)]
    link_abs_only: bool,

    /// Redirect calls through synthesized veneers to extend their range
    #[arg(long)]
    long_calls: bool,

    /// Keep compiler-internal temporary labels visible
    #[arg(long)]
    print_temp: bool,

    /// Emit patch blocks for hook_<address> symbols (default)
    #[arg(long, overrides_with = "no_hook")]
    auto_hook: bool,

    /// Do not emit patch blocks for hook_<address> symbols
    #[arg(long, overrides_with = "auto_hook")]
    no_hook: bool,

    /// Emit section contents untouched (implies --no-link --no-hook)
    #[arg(long)]
    raw: bool,
}

impl Args {
    fn link_locals(&self) -> bool {
        !(self.no_link || self.link_abs_only || self.raw)
    }

    fn link_absolutes(&self) -> bool {
        !(self.no_link || self.raw)
    }

    fn make_trampolines(&self) -> bool {
        self.long_calls && !self.raw
    }

    fn apply_hooks(&self) -> bool {
        self.auto_hook || !(self.no_hook || self.raw)
    }
}

fn run(args: &Args, logger: &mut Logger) -> Result<(), Error> {
    let mut object = EventObject::new();

    for (index, path) in args.objects.iter().enumerate() {
        logger.set_title(format!("Reading {}", path.display()));
        object.append_object(load_object(path, index)?);
    }

    if let Some(path) = &args.symbols {
        let text = std::fs::read_to_string(path).map_err(|err| Error::Io(format!("{}: {}", path.display(), err)))?;
        object.add_absolutes(parse_symbol_table(&text)?);
    }

    logger.set_title("Linking");

    if args.link_locals() {
        object.link_locals()?;
    }

    if args.make_trampolines() {
        object.make_trampolines()?;
    }

    if !args.print_temp {
        object.link_temporaries()?;
        object.remove_temporaries();
    }

    if args.link_absolutes() {
        object.link_absolutes()?;
    }

    object.prune_symbols();

    let pending = object.section().relocations().len();

    if pending > 0 {
        logger.info(format!("{} reference(s) left for the event assembler", pending));
    }

    let stdout = std::io::stdout().lock();
    let mut output = BufWriter::new(stdout);

    if args.apply_hooks() {
        write_hook_events(&mut output, &object.hooks())?;
    }

    object.write_events(&mut output)?;
    output.flush().map_err(|err| Error::Io(err.to_string()))?;

    Ok(())
}

fn main() {
    let args = Args::parse();
    let mut logger = Logger::spinner();

    if let Err(err) = run(&args, &mut logger) {
        logger.error(err.to_string());
        std::process::exit(1);
    }
}
