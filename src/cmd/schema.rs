//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_output, cost::PriceTableFile, prelude::*, prompt::ChatPrompt,
    results::BatchResult,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The JSON report written by `analyze --format json`.
    BatchResult,
    /// A `--price-table` file.
    PriceTable,
    /// A `--prompt` file.
    ChatPrompt,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::BatchResult => schema_for!(BatchResult),
        SchemaType::PriceTable => schema_for!(PriceTableFile),
        SchemaType::ChatPrompt => schema_for!(ChatPrompt),
    };

    let mut schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    schema_str.push('\n');
    write_output(schema_opts.output_path.as_deref(), schema_str.as_bytes()).await
}
