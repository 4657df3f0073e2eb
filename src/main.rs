use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use deploy_tune::cli::{describe_config, Args, Command};
use deploy_tune::optimize::manager::{read_document, schema_version};
use deploy_tune::optimize::version::search_versioned_file;
use deploy_tune::optimize::{ComponentVersion, ManagerConfig, OptimizeConfig, ParserRegistry};
use deploy_tune::{logging, OptimizeError};

fn check(file: &std::path::Path) -> Result<bool, OptimizeError> {
    let document = read_document(file)?;
    let mut registry = ParserRegistry::default();
    let requested: ComponentVersion = match schema_version(&document) {
        Some(version) => version.parse()?,
        None => registry
            .latest()
            .cloned()
            .ok_or_else(|| OptimizeError::NoParser("<none registered>".to_string()))?,
    };
    let parser = registry.resolve(&requested)?;
    info!(schema = parser.schema_version(), path = %file.display(), "checking optimize document");

    let mut config = OptimizeConfig::new();
    let ok = parser.load(&mut config, &document);
    for line in describe_config(&config) {
        println!("{}", line);
    }
    Ok(ok)
}

fn search(home: &std::path::Path, component: &str, version: &str, file: &str) -> Result<bool, OptimizeError> {
    let config = ManagerConfig::new(home);
    let version: ComponentVersion = version.parse()?;
    match search_versioned_file(&config.optimize_root(), component, &version, file, &config.sentinel_version) {
        Some(path) => {
            println!("{}", path.display());
            Ok(true)
        }
        None => {
            println!("no {} found for {} {}", file, component, version);
            Ok(false)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_tracing(args.verbose);

    let outcome = match &args.command {
        Command::Check { file } => check(file),
        Command::Search { home, component, version, file } => search(home, component, version, file),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
