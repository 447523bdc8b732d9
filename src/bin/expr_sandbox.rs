// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line front end for the expression engine
//!
//! Evaluates single expressions or batches against a JSON root read from a
//! file or stdin.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use expr_sandbox::registry::EnvConfigResolver;
use expr_sandbox::{
    Backend, CompileOptions, EngineConfig, Expression, ExpressionEngine, ExpressionSource, Value,
    ValueMap,
};
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "expr-sandbox")]
#[command(about = "Evaluate sandboxed expressions against JSON data")]
#[command(version)]
#[command(author = "OctoFHIR Team <funyloony@gmail.com>")]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Let `resolveConfig` read environment variables named `<PREFIX>_<KEY>`
    #[arg(long, global = true)]
    env_prefix: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one expression
    Eval {
        /// Expression source
        expression: String,
        /// Backend: path, compiled, script or script-expression
        #[arg(short, long)]
        backend: Option<Backend>,
        /// JSON root (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<String>,
        /// Evaluate sandboxed
        #[arg(short, long)]
        sandbox: bool,
        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },
    /// Evaluate a batch of output expressions
    Batch {
        /// JSON file holding an array of expressions
        expressions: String,
        /// JSON root (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<String>,
        /// JSON object exposed as `context`
        #[arg(long)]
        context: Option<String>,
        /// Sandbox expressions that do not choose a mode
        #[arg(short, long)]
        sandbox: bool,
        /// Stop at the first failing expression
        #[arg(long)]
        strict: bool,
        /// Pretty-print JSON output
        #[arg(short, long)]
        pretty: bool,
    },
    /// Compile an expression and report errors
    Check {
        /// Expression source
        expression: String,
        /// Backend: path, compiled, script or script-expression
        #[arg(short, long)]
        backend: Option<Backend>,
    },
}

fn main() -> Result<()> {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .parse_default_env()
        .init();

    let config = match &cli.config {
        Some(path) => serde_json::from_str(&read_source(Some(path))?)
            .with_context(|| format!("invalid engine configuration in '{path}'"))?,
        None => EngineConfig::default(),
    };
    let mut builder = ExpressionEngine::builder().config(config);
    if let Some(prefix) = &cli.env_prefix {
        builder = builder.config_resolver(Arc::new(EnvConfigResolver::with_prefix(prefix)));
    }
    let engine = builder.build();

    match cli.command {
        Commands::Eval {
            expression,
            backend,
            file,
            sandbox,
            pretty,
        } => {
            let root = read_json(file.as_deref())?;
            let source = match backend {
                Some(backend) => ExpressionSource::text(&expression, backend),
                None => ExpressionSource::from(expression.as_str()),
            };
            let value = engine.evaluate_with_exception(source, root, sandbox)?;
            print_json(&serde_json::Value::from(&value), pretty)
        }
        Commands::Batch {
            expressions,
            file,
            context,
            sandbox,
            strict,
            pretty,
        } => {
            let expressions: Vec<Expression> = serde_json::from_str(&read_source(Some(&expressions))?)
                .context("expressions file must hold an array of expressions")?;
            let root = read_json(file.as_deref())?;
            let context = match context {
                Some(path) => match read_json(Some(&path))? {
                    Value::Map(map) => map,
                    other => bail!("context must be a JSON object, got {}", other.type_name()),
                },
                None => ValueMap::new(),
            };
            let result = if strict {
                engine.evaluate_batch_with_exception(&expressions, &root, sandbox, &context)?
            } else {
                engine.evaluate_batch(&expressions, &root, sandbox, &context)
            };
            print_json(&serde_json::Value::from(&Value::Map(result)), pretty)
        }
        Commands::Check {
            expression,
            backend,
        } => {
            let backend = backend.unwrap_or_else(|| engine.default_backend());
            engine.compile(&expression, backend, false, CompileOptions::precompiled())?;
            println!("ok ({backend})");
            Ok(())
        }
    }
}

fn read_source(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("cannot read '{path}'")),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("cannot read stdin")?;
            Ok(buffer)
        }
    }
}

fn read_json(path: Option<&str>) -> Result<Value> {
    let text = read_source(path)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let json: serde_json::Value = serde_json::from_str(&text).context("invalid JSON input")?;
    Ok(Value::from(json))
}

fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{output}");
    Ok(())
}
