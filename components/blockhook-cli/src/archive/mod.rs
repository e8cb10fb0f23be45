use crate::config::Config;
use blockhook_sdk::utils::Context;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read, Write};

/// Streams the remote Stacks events archive to disk, decompressing on the
/// fly. Returns whether a fresh dataset landed locally.
pub async fn download_stacks_dataset_if_required(
    config: &mut Config,
    ctx: &Context,
) -> Result<bool, String> {
    if !config.should_download_remote_stacks_tsv() {
        // Use the local tsv already present.
        return Ok(config.rely_on_remote_stacks_tsv());
    }

    let url = config.expected_remote_stacks_tsv_url()?.clone();
    let destination_path = config.expected_local_stacks_tsv_file()?;

    let mut destination_dir = destination_path.clone();
    destination_dir.pop();
    fs::create_dir_all(&destination_dir)
        .map_err(|e| format!("unable to create directory {}: {}", destination_dir.display(), e))?;

    info!(
        ctx.expect_logger(),
        "Downloading Stacks events archive {} to {}",
        url,
        destination_path.display()
    );

    let response = reqwest::get(&url)
        .await
        .map_err(|e| format!("unable to download archive {}: {}", url, e))?;
    if !response.status().is_success() {
        return Err(format!(
            "unable to download archive {}: status {}",
            url,
            response.status()
        ));
    }

    let compressed = response
        .bytes()
        .await
        .map_err(|e| format!("unable to read archive body: {}", e))?;

    info!(
        ctx.expect_logger(),
        "Archive downloaded ({} compressed bytes), decompressing", compressed.len()
    );

    let mut decoder = GzDecoder::new(&compressed[..]);
    let file = fs::File::create(&destination_path).map_err(|e| {
        format!(
            "unable to create file {}: {}",
            destination_path.display(),
            e
        )
    })?;
    let mut writer = io::BufWriter::new(file);
    let mut buffer = [0u8; 512 * 1024];
    let mut total_written = 0u64;
    loop {
        let bytes_read = decoder
            .read(&mut buffer)
            .map_err(|e| format!("unable to decompress archive: {}", e))?;
        if bytes_read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| format!("unable to write archive: {}", e))?;
        total_written += bytes_read as u64;
        if total_written % (1024 * 1024 * 1024) < (512 * 1024) {
            info!(
                ctx.expect_logger(),
                "Decompressed {} mb", total_written / (1024 * 1024)
            );
        }
    }
    writer
        .flush()
        .map_err(|e| format!("unable to flush archive: {}", e))?;

    info!(
        ctx.expect_logger(),
        "Stacks events archive ready ({} bytes)", total_written
    );

    config.add_local_stacks_tsv_source(&destination_path);
    Ok(true)
}
