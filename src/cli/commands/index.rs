//! Index command - rebuild a signed index over emitted archives

use crate::apk::{generate_index, write_json_index, IndexOptions};
use crate::cli::args::IndexArgs;
use crate::error::ForgeResult;

/// Execute the index command
pub async fn execute(args: IndexArgs) -> ForgeResult<()> {
    let opts = IndexOptions {
        package_files: args.packages,
        signing_key: args.signing_key,
        signing_passphrase: args.signing_passphrase,
        merge_existing: args.merge,
        index_file: args.output.clone(),
    };

    let entries = generate_index(&opts).await?;

    let json_path = args.output.with_file_name("APKINDEX.json");
    write_json_index(&entries, &json_path)?;

    Ok(())
}
