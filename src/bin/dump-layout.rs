use clap::Parser;
use dotnet_marshal::{
    config::MarshalConfig,
    layout::{ffi, persist, LayoutRegistry, TypeLayout},
    types::{schema::SchemaFile, MetadataSource},
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compute and print the native layout of the types in a schema"
)]
struct Args {
    /// JSON schema describing the types
    schema: PathBuf,
    /// Only print these types (default: all of them)
    #[arg(short, long = "type", value_name = "NAME")]
    types: Vec<String>,
    /// Default packing for types that do not declare one
    #[arg(long)]
    packing: Option<u32>,
    /// Enable the COM/OLE-automation strategies
    #[arg(long)]
    platform_extensions: bool,
    /// Compare each layout against the size and alignment libffi computes
    #[arg(long)]
    abi: bool,
    /// Save the computed layouts to FILE
    #[arg(long, value_name = "FILE")]
    persist: Option<PathBuf>,
}

fn print_layout(layout: &TypeLayout) {
    println!(
        "{} ({:?}, {:?}, pack {}): native {} bytes align {}, managed {} bytes align {}{}",
        layout.name,
        layout.kind,
        layout.layout_kind,
        layout.packing,
        layout.native_size,
        layout.native_alignment,
        layout.managed_size,
        layout.managed_alignment,
        if layout.blittable { ", blittable" } else { "" }
    );
    for e in &layout.entries {
        println!(
            "  {:<20} {:<20} native {:<14} managed {:<14} {:?} {:?}",
            e.name(),
            e.descriptor.field_type.to_string(),
            e.native.to_string(),
            e.managed.to_string(),
            e.tag(),
            e.category()
        );
    }
}

fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(&args.schema)?;
    let universe = SchemaFile::from_json(&text)?.into_universe()?;

    let mut config = MarshalConfig::from_env();
    if let Some(p) = args.packing {
        config = config.with_default_packing(p);
    }
    if args.platform_extensions {
        config = config.with_platform_extensions(true);
    }

    let names: Vec<String> = if args.types.is_empty() {
        universe.iter().map(|(_, d)| d.name.clone()).collect()
    } else {
        args.types.clone()
    };
    let universe = Arc::new(universe);
    let registry = LayoutRegistry::new(universe.clone(), config);

    let mut ok = true;
    let mut computed = vec![];
    for name in &names {
        match registry.layout_by_name(name) {
            Ok(layout) => {
                print_layout(&layout);
                if args.abi {
                    match ffi::native_abi_type(&registry, &layout) {
                        Some(ty) => {
                            let (size, align) = ffi::abi_size_align(ty);
                            let agrees = (size, align)
                                == (layout.native_size as usize, layout.native_alignment as usize);
                            println!(
                                "  libffi: {} bytes align {}{}",
                                size,
                                align,
                                if agrees { "" } else { "  MISMATCH" }
                            );
                            ok &= agrees;
                        }
                        None => println!("  libffi: no plain C equivalent"),
                    }
                }
                computed.push(layout);
            }
            Err(e) => {
                eprintln!("{}: {}", name, e);
                ok = false;
            }
        }
    }

    if let Some(path) = &args.persist {
        let meta: &dyn MetadataSource = &*universe;
        std::fs::write(path, persist::save_layouts(meta, &computed)?)?;
        eprintln!("saved {} layouts to {}", computed.len(), path.display());
    }
    Ok(ok)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
