/// Reads the completed fraction from a yt-dlp progress line such as
/// `[download]  42.3% of ~  3.52MiB at  1.20MiB/s ETA 00:02`.
pub fn parse_progress_from_line(line: &str) -> Option<f32> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let number = rest.split_whitespace().next()?.strip_suffix('%')?;
    let pct = number.parse::<f32>().ok()?;
    Some((pct / 100.0).clamp(0.0, 1.0))
}
