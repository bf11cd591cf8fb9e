use clap::{Parser, Subcommand};
use std::fs;
use std::process::ExitCode;
use wagc::encoder;
use wagc::parser::{self, module::Module, reader::Reader};

#[derive(Parser)]
#[command(name = "wagc")]
#[command(about = "WebAssembly GC type-section toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump module information (defaults to the type section detail)
    Dump {
        /// Path to the WebAssembly module
        file: String,

        /// Show only module header (magic, version)
        #[arg(long)]
        header: bool,
    },

    /// Re-encode a module and check that the bytes round-trip
    Roundtrip {
        /// Path to the WebAssembly module
        file: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { file, header } => dump(&file, header),
        Commands::Roundtrip { file } => roundtrip(&file),
    }
}

fn load(path: &str) -> Result<(Vec<u8>, Module), String> {
    let bytes = fs::read(path).map_err(|e| format!("failed to read {path}: {e}"))?;
    let module = parser::parse(path, &mut Reader::new(bytes.clone()))
        .map_err(|e| format!("failed to parse {path}: {e}"))?;
    Ok((bytes, module))
}

fn dump(path: &str, header_only: bool) -> ExitCode {
    let (_, module) = match load(path) {
        Ok(loaded) => loaded,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    println!("module: {}", module.name);
    println!("magic: 0x{:08x}", module.magic);
    println!("version: {}", module.version);
    if header_only {
        return ExitCode::SUCCESS;
    }

    print!("{}", module.types.to_details_string());
    if !module.functions.functions.is_empty() {
        println!("Function[{}]:", module.functions.functions.len());
        for (i, function) in module.functions.functions.iter().enumerate() {
            println!(" - func[{}] type[{}]", i, function.ftype_index);
        }
    }
    if !module.data.data.is_empty() {
        println!("Data[{}]:", module.data.data.len());
        for (i, segment) in module.data.data.iter().enumerate() {
            println!(" - data[{}] {} bytes ({:?})", i, segment.init.len(), segment.mode);
        }
    }
    for section in &module.raw_sections {
        match &section.name {
            Some(name) => println!("custom section '{}': {} bytes", name, section.bytes.len()),
            None => println!("section #{}: {} bytes", section.id, section.bytes.len()),
        }
    }

    ExitCode::SUCCESS
}

fn roundtrip(path: &str) -> ExitCode {
    let (original, module) = match load(path) {
        Ok(loaded) => loaded,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let encoded = match encoder::encode(&module) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("failed to encode {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if encoded == original {
        println!("{path}: {} bytes, round-trip ok", original.len());
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "{path}: round-trip mismatch (original {} bytes, encoded {} bytes)",
            original.len(),
            encoded.len()
        );
        ExitCode::FAILURE
    }
}
