use std::collections::BTreeMap;
use std::rc::Rc;
use std::{env, fs, path::Path};

use zephyr::bytecode::disasm::print_chunk;
use zephyr::frontend::lexer::Lexer;
use zephyr::frontend::token_dumper::TokenDumper;
use zephyr::runtime::registry::BAKED_EXTENSION;
use zephyr::{
    ArgBag, EntityId, EntityLookup, EventQueue, EventSink, RuntimeContext, ScriptDefinition,
    ScriptRegistry, Vm,
};

const SOURCE_EXTENSION: &str = "zephyr";
const CONSOLE_ENTITY: EntityId = 1;

#[derive(Debug, Default)]
struct CliArgs {
    filename: Option<String>,
    tokens_only: bool,
    no_color: bool,
    pretty: bool,
    bytecode: bool,
    bake: Option<String>,
    state: Option<String>,
    dispatch: Vec<String>,
    help: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(2);
        }
    };

    let filename = match &args.filename {
        Some(filename) if !args.help => filename.clone(),
        _ => {
            print_usage();
            return;
        }
    };

    ensure_extension(&filename);

    if args.tokens_only {
        dump_tokens(&filename, args.no_color, args.pretty);
        return;
    }

    let mut registry = ScriptRegistry::new();
    let definition = match registry.load(&filename) {
        Ok(def) => def,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if args.bytecode {
        print_definition(&definition);
    }

    if let Some(out) = &args.bake {
        bake(&definition, out);
    }

    if !args.dispatch.is_empty() {
        run_events(definition, args.state.as_deref(), &args.dispatch);
    } else if !args.bytecode && args.bake.is_none() {
        println!(
            "compiled '{}': {} state(s), {} handler(s)",
            definition.name,
            definition.states.len(),
            definition.handler_count()
        );
    }
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--tokens" => args.tokens_only = true,
            "--no-color" => args.no_color = true,
            "--pretty" => args.pretty = true,
            "--bc" | "--bytecode" => args.bytecode = true,
            "--help" | "-h" => args.help = true,
            "--bake" => args.bake = Some(flag_value(&mut raw, "--bake")?),
            "--state" => args.state = Some(flag_value(&mut raw, "--state")?),
            "--dispatch" => args.dispatch.push(flag_value(&mut raw, "--dispatch")?),
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{}'", flag)),
            _ if args.filename.is_none() => args.filename = Some(arg),
            _ => return Err(format!("unexpected argument '{}'", arg)),
        }
    }

    Ok(args)
}

fn flag_value(raw: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    raw.next()
        .filter(|v| !v.starts_with('-'))
        .ok_or_else(|| format!("{} expects a value", flag))
}

fn print_usage() {
    println!("ZEPHYR - entity behavior scripting");
    println!();
    println!("Usage:");
    println!("  zephyr <file.zephyr>                    Compile and summarize a script");
    println!("  zephyr --tokens <file> [--no-color] [--pretty]");
    println!("                                          Show tokens only");
    println!("  zephyr --bc <file>                      Disassemble every handler");
    println!("  zephyr <file> --bake <out.zbc>          Write a baked script");
    println!("  zephyr <file> [--state S] --dispatch E  Run events (repeatable, FIFO)");
    println!("  zephyr --help, -h                       Show this help");
    println!();
    println!("Baked .zbc files are accepted wherever a source file is.");
    println!("Log verbosity follows RUST_LOG (default: warn).");
}

fn ensure_extension(filename: &str) {
    let ext = Path::new(filename).extension().and_then(|e| e.to_str());
    if ext != Some(SOURCE_EXTENSION) && ext != Some(BAKED_EXTENSION) {
        eprintln!(
            "Error: expected a .{} or .{} file, got {}",
            SOURCE_EXTENSION, BAKED_EXTENSION, filename
        );
        std::process::exit(1);
    }
}

fn dump_tokens(filename: &str, no_color: bool, pretty: bool) {
    let source = match fs::read_to_string(filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };

    let tokens = Lexer::new(&source).tokenize();
    let mut dumper = TokenDumper::new();

    if no_color {
        dumper = dumper.no_color();
    }
    if pretty {
        dumper = dumper.pretty();
    }

    dumper.dump(&tokens);
}

fn print_definition(definition: &ScriptDefinition) {
    println!(
        "=== {} ({}) ===",
        definition.name,
        definition.states.join(", ")
    );
    for (_, _, chunk) in definition.handlers() {
        print_chunk(chunk);
    }
}

fn bake(definition: &ScriptDefinition, out: &str) {
    let bytes = match definition.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to encode '{}': {}", definition.name, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = fs::write(out, &bytes) {
        eprintln!("Failed to write '{}': {}", out, e);
        std::process::exit(1);
    }
    println!("baked {} bytes to {}", bytes.len(), out);
}

fn run_events(definition: Rc<ScriptDefinition>, state: Option<&str>, events: &[String]) {
    let name = definition.name.clone();
    let initial = state.unwrap_or(definition.initial_state()).to_string();
    let context = match RuntimeContext::new(definition, &initial) {
        Ok(ctx) => ctx.with_owner(CONSOLE_ENTITY),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let mut host = ConsoleHost {
        name,
        context: Some(context),
    };
    let mut queue = EventQueue::new();
    for event in events {
        queue.push(CONSOLE_ENTITY, event.as_str(), ArgBag::new());
    }

    let faults = queue.drain(&mut Vm::new(), &mut host);
    for fault in &faults {
        eprintln!("{}", fault);
    }

    if let Some(ctx) = &host.context {
        println!("state: {}", ctx.state());
        let variables: BTreeMap<_, _> = ctx.variables().iter().collect();
        for (name, value) in variables {
            println!("  {} = {}", name, value);
        }
    }

    if !faults.is_empty() {
        std::process::exit(1);
    }
}

/// Single-entity host that prints every event it receives.
struct ConsoleHost {
    name: String,
    context: Option<RuntimeContext>,
}

impl EventSink for ConsoleHost {
    fn fire_event(&mut self, event: &str, args: &ArgBag) {
        let args: Vec<String> = args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if args.is_empty() {
            println!("FireEvent {}", event);
        } else {
            println!("FireEvent {}({})", event, args.join(", "));
        }
    }
}

impl EntityLookup for ConsoleHost {
    fn resolve(&self, name: &str) -> Option<EntityId> {
        (name == self.name).then_some(CONSOLE_ENTITY)
    }

    fn take_context(&mut self, id: EntityId) -> Option<RuntimeContext> {
        if id == CONSOLE_ENTITY {
            self.context.take()
        } else {
            None
        }
    }

    fn return_context(&mut self, id: EntityId, context: RuntimeContext) {
        if id == CONSOLE_ENTITY {
            self.context = Some(context);
        }
    }

    fn has_script(&self, id: EntityId) -> bool {
        id == CONSOLE_ENTITY
    }
}
