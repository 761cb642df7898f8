use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

/// Counted progress bar with rate and ETA
pub fn bar(total: u64, label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {percent}% ({per_sec}, ETA {eta})",
            )?
            .progress_chars("#>-"),
    );
    pb.set_message(label.to_string());
    Ok(pb)
}

