//! Command line front-end: parses arguments, drives one `Linker` per
//! version in the version map, and writes every requested output format.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

use kamek::dol::DolFile;
use kamek::error::Error;
use kamek::externals::Externals;
use kamek::linker::Linker;
use kamek::version_map::VersionMap;

struct Args {
    elf_paths: Vec<PathBuf>,
    dynamic: bool,
    static_addr: Option<u32>,
    extern_path: Option<PathBuf>,
    versionmap_path: Option<PathBuf>,
    input_dol: Option<PathBuf>,
    output_kamek: Option<String>,
    output_riiv: Option<String>,
    output_gecko: Option<String>,
    output_code: Option<String>,
    output_dol: Option<String>,
    verbosity: usize,
}

fn print_usage() {
    eprintln!("Usage: kamek-link [options] <elf-or-dir>...");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --dynamic                  The module is dynamically relocated");
    eprintln!("  --static <hex-addr>        The module is statically located at ADDR");
    eprintln!("  --extern <file>            External linker map");
    eprintln!("  --versionmap <file>        Version map for address translations");
    eprintln!("  --input-dol <file>         DOL to patch (required with --output-dol)");
    eprintln!("  --output-kamek <path>      Write a Kamek binary ('$KV$' -> version name)");
    eprintln!("  --output-riiv <path>       Write a Riivolution XML patch");
    eprintln!("  --output-gecko <path>      Write Gecko codes");
    eprintln!("  --output-code <path>       Write the raw linked code image");
    eprintln!("  --output-dol <path>        Write a patched DOL");
    eprintln!("  -v                         Increase log verbosity (repeatable)");
}

fn parse_args() -> Result<Args, String> {
    let raw: Vec<String> = env::args().collect();

    let mut elf_paths = Vec::new();
    let mut dynamic = false;
    let mut static_addr = None;
    let mut extern_path = None;
    let mut versionmap_path = None;
    let mut input_dol = None;
    let mut output_kamek = None;
    let mut output_riiv = None;
    let mut output_gecko = None;
    let mut output_code = None;
    let mut output_dol = None;
    let mut verbosity = 0;

    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--dynamic" => {
                dynamic = true;
                i += 1;
            }
            "--static" => {
                let value = raw.get(i + 1).ok_or("--static requires an argument")?;
                let value = value.strip_prefix("0x").unwrap_or(value);
                static_addr = Some(u32::from_str_radix(value, 16).map_err(|e| e.to_string())?);
                i += 2;
            }
            "--extern" => {
                extern_path = Some(PathBuf::from(raw.get(i + 1).ok_or("--extern requires an argument")?));
                i += 2;
            }
            "--versionmap" => {
                versionmap_path = Some(PathBuf::from(raw.get(i + 1).ok_or("--versionmap requires an argument")?));
                i += 2;
            }
            "--input-dol" => {
                input_dol = Some(PathBuf::from(raw.get(i + 1).ok_or("--input-dol requires an argument")?));
                i += 2;
            }
            "--output-kamek" => {
                output_kamek = Some(raw.get(i + 1).ok_or("--output-kamek requires an argument")?.clone());
                i += 2;
            }
            "--output-riiv" => {
                output_riiv = Some(raw.get(i + 1).ok_or("--output-riiv requires an argument")?.clone());
                i += 2;
            }
            "--output-gecko" => {
                output_gecko = Some(raw.get(i + 1).ok_or("--output-gecko requires an argument")?.clone());
                i += 2;
            }
            "--output-code" => {
                output_code = Some(raw.get(i + 1).ok_or("--output-code requires an argument")?.clone());
                i += 2;
            }
            "--output-dol" => {
                output_dol = Some(raw.get(i + 1).ok_or("--output-dol requires an argument")?.clone());
                i += 2;
            }
            "-v" => {
                verbosity += 1;
                i += 1;
            }
            arg if arg.starts_with("--") => {
                return Err(format!("unknown option: {arg}"));
            }
            arg => {
                elf_paths.push(PathBuf::from(arg));
                i += 1;
            }
        }
    }

    if elf_paths.is_empty() {
        return Err("no ELF object files or directories given".into());
    }
    if dynamic && static_addr.is_some() {
        return Err("`--dynamic' and `--static' cannot be used together".into());
    }
    if !dynamic && static_addr.is_none() {
        return Err("must provide either `--dynamic' or `--static'".into());
    }
    if output_dol.is_some() && input_dol.is_none() {
        return Err("`--output-dol' requires `--input-dol'".into());
    }
    if output_kamek.is_none() && output_riiv.is_none() && output_gecko.is_none() && output_code.is_none() && output_dol.is_none() {
        return Err("at least one output format must be requested".into());
    }

    Ok(Args {
        elf_paths,
        dynamic,
        static_addr,
        extern_path,
        versionmap_path,
        input_dol,
        output_kamek,
        output_riiv,
        output_gecko,
        output_code,
        output_dol,
        verbosity,
    })
}

/// Expands directory arguments into their contained files, matching the
/// distilled tool's own loader behavior for folders of object files.
fn expand_elf_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.path().is_file() {
                    out.push(entry.path());
                }
            }
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn substitute_version(template: &str, version: &str) -> PathBuf {
    PathBuf::from(template.replace("$KV$", version))
}

fn run(args: Args) -> Result<(), Error> {
    stderrlog::new()
        .verbosity(args.verbosity + 1)
        .init()
        .map_err(|e| Error::InvalidOperation(e.to_string()))?;

    let externals = match &args.extern_path {
        Some(path) => Externals::load(path)?,
        None => Externals::new(),
    };

    let version_map = match &args.versionmap_path {
        Some(path) => VersionMap::load(path)?,
        None => VersionMap::default_single(),
    };

    let elf_paths = expand_elf_paths(&args.elf_paths)?;

    for (version, mapper) in version_map.iter() {
        log::info!("linking version {version}");

        let mut linker = Linker::new(mapper.clone());
        let kbin = if args.dynamic {
            linker.link_dynamic(&elf_paths, &externals)?
        } else {
            linker.link_static(&elf_paths, &externals, args.static_addr)?
        };

        if let Some(template) = &args.output_kamek {
            let path = substitute_version(template, version);
            fs::write(&path, kbin.pack()?)?;
        }
        if let Some(template) = &args.output_riiv {
            let path = substitute_version(template, version);
            fs::write(&path, kbin.pack_riivo(version)?)?;
        }
        if let Some(template) = &args.output_gecko {
            let path = substitute_version(template, version);
            fs::write(&path, kbin.pack_gecko()?)?;
        }
        if let Some(template) = &args.output_code {
            let path = substitute_version(template, version);
            fs::write(&path, &kbin.code)?;
        }
        if let Some(template) = &args.output_dol {
            let input = args.input_dol.as_ref().expect("checked in parse_args");
            let mut dol = DolFile::parse(&fs::read(input)?)?;
            kbin.apply_to_dol(&mut dol)?;
            let path = substitute_version(template, version);
            fs::write(&path, dol.save())?;
        }
    }

    Ok(())
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("kamek-link: {msg}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(err) = run(args) {
        eprintln!("kamek-link: {err}");
        process::exit(1);
    }
}
