use std::{path::PathBuf, process::Stdio, time::SystemTime};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use tokio::{fs, process::Command as TokioCommand};

use crate::model::TrackRef;

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("rhea-bot/0.1 (+https://github.com/)")
        .build()
        .expect("client")
});

const GITHUB_RELEASES_API: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    assets: Vec<ReleaseAsset>,
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| anyhow!("no cache dir available on this system"))?;
    Ok(base.join("rhea").join("yt-dlp"))
}

fn platform_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        if cfg!(target_arch = "x86_64") {
            "yt-dlp.exe"
        } else {
            "yt-dlp_x86.exe"
        }
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

async fn ensure_yt_dlp() -> Result<PathBuf> {
    if let Ok(p) = which::which("yt-dlp") {
        return Ok(p);
    }

    let dir = cache_dir()?;
    fs::create_dir_all(&dir).await.ok();

    let local = dir.join(if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    });
    if fs::try_exists(&local).await.unwrap_or(false) {
        return Ok(local);
    }

    let resp = HTTP
        .get(GITHUB_RELEASES_API)
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .await?
        .error_for_status()?;
    let rel: ReleaseInfo = resp.json().await?;

    let wanted = platform_asset_name();
    let asset = rel
        .assets
        .into_iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| anyhow!("no suitable yt-dlp asset for this platform: {}", wanted))?;

    let bytes = HTTP
        .get(asset.browser_download_url)
        .header(USER_AGENT, "rhea-bot/0.1")
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    fs::write(&local, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&local).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&local, perms).await?;
    }
    Ok(local)
}

/// Resolve a URL or free-text search into a track descriptor without
/// downloading anything. Free text goes through a single-result search.
pub async fn probe_track(query: &str) -> Result<TrackRef> {
    let target = if url::Url::parse(query).is_ok() {
        query.to_string()
    } else {
        format!("ytsearch1:{query}")
    };

    let ytdlp = ensure_yt_dlp().await?;
    let out = TokioCommand::new(&ytdlp)
        .arg("--print")
        .arg("webpage_url")
        .arg("--print")
        .arg("title")
        .arg("--print")
        .arg("uploader")
        .arg("--print")
        .arg("duration")
        .arg("--print")
        .arg("thumbnail")
        .arg("--print")
        .arg("is_live")
        .arg("--skip-download")
        .arg("--no-playlist")
        .arg("-q")
        .arg(&target)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp to probe track")?;
    if !out.status.success() {
        return Err(anyhow!(
            "yt-dlp probe failed with status: {}",
            out.status
        ));
    }
    parse_probe_output(&String::from_utf8_lossy(&out.stdout))
}

fn parse_probe_output(stdout: &str) -> Result<TrackRef> {
    let mut lines = stdout.lines().map(str::trim);
    let url = lines
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("yt-dlp probe returned no url"))?
        .to_string();
    let title = lines.next().unwrap_or("unknown").to_string();
    let author = lines.next().unwrap_or("unknown").to_string();
    let duration_ms = lines
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64);
    let artwork_url = lines
        .next()
        .filter(|s| !s.is_empty() && *s != "NA")
        .map(str::to_string);
    let live = lines.next().map(|s| s == "True").unwrap_or(false);

    Ok(TrackRef {
        url,
        title,
        author,
        duration_ms: if live { None } else { duration_ms },
        artwork_url,
        live,
    })
}

fn download_base_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DOWNLOAD_FOLDER") {
        let p = PathBuf::from(dir);
        if p.is_absolute() {
            Ok(p)
        } else {
            Ok(std::env::current_dir()?.join(p))
        }
    } else {
        Ok(cache_dir()?.join("downloads"))
    }
}

async fn ytdlp_extract_id(ytdlp: &PathBuf, url: &str) -> Result<String> {
    let out = TokioCommand::new(ytdlp)
        .arg("--print")
        .arg("id")
        .arg("--skip-download")
        .arg("-q")
        .arg(url)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp to extract id")?;
    if !out.status.success() {
        return Err(anyhow!(
            "yt-dlp --print id failed with status: {}",
            out.status
        ));
    }
    let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if id.is_empty() {
        return Err(anyhow!("empty id from yt-dlp"));
    }
    Ok(id)
}

/// Fetch playable audio for a track, reusing the on-disk cache when the same
/// video was fetched before.
pub async fn fetch_audio(url: &str) -> Result<PathBuf> {
    let ytdlp = ensure_yt_dlp().await?;
    let base = download_base_dir()?;
    fs::create_dir_all(&base).await?;

    // Resolve a stable video ID for caching; fall back to a timestamp.
    let vid = match ytdlp_extract_id(&ytdlp, url).await {
        Ok(v) => v,
        Err(_) => format!(
            "ts-{}",
            SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ),
    };
    let cached = base.join(format!("{vid}.mp3"));
    if fs::try_exists(&cached).await.unwrap_or(false) {
        return Ok(cached);
    }

    // Unique working dir per fetch to avoid cross-task collisions.
    let dir = base.join(format!(
        "job-{}",
        SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    fs::create_dir_all(&dir).await?;

    let status = TokioCommand::new(&ytdlp)
        .arg("-f")
        .arg("bestaudio/best")
        .arg("-x")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg("0")
        .arg("--postprocessor-args")
        .arg("ffmpeg:-ar 48000 -ac 2") // 48kHz stereo, Discord's preferred format
        .arg("--no-playlist")
        .arg("-o")
        .arg(dir.join("%(id)s.%(ext)s").to_string_lossy().to_string())
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("running yt-dlp to fetch audio")?;
    if !status.success() {
        let _ = fs::remove_dir_all(&dir).await;
        return Err(anyhow!("yt-dlp failed with status: {status}"));
    }

    let mut entries = fs::read_dir(&dir).await?;
    let mut produced = None;
    while let Some(e) = entries.next_entry().await? {
        let p = e.path();
        if p.extension().and_then(|s| s.to_str()) == Some("mp3") {
            produced = Some(p);
            break;
        }
    }
    let produced = produced.ok_or_else(|| anyhow!("no mp3 produced"))?;

    // Move into the cache slot, handling races and cross-device moves.
    let final_path = if fs::try_exists(&cached).await.unwrap_or(false)
        || fs::rename(&produced, &cached).await.is_ok()
    {
        cached.clone()
    } else if fs::copy(&produced, &cached).await.is_ok() {
        let _ = fs::remove_file(&produced).await;
        cached.clone()
    } else {
        produced.clone()
    };
    let _ = fs::remove_dir_all(&dir).await;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_parses_full_track() {
        let stdout = "https://example.com/watch?v=abc\nSong Title\nArtist\n213.0\nhttps://img.example/abc.jpg\nFalse\n";
        let track = parse_probe_output(stdout).unwrap();
        assert_eq!(track.url, "https://example.com/watch?v=abc");
        assert_eq!(track.title, "Song Title");
        assert_eq!(track.author, "Artist");
        assert_eq!(track.duration_ms, Some(213_000));
        assert_eq!(track.artwork_url.as_deref(), Some("https://img.example/abc.jpg"));
        assert!(!track.live);
    }

    #[test]
    fn probe_output_live_stream_has_no_duration() {
        let stdout = "https://example.com/live\nRadio\nStation\nNA\nNA\nTrue\n";
        let track = parse_probe_output(stdout).unwrap();
        assert!(track.live);
        assert_eq!(track.duration_ms, None);
        assert_eq!(track.artwork_url, None);
    }

    #[test]
    fn probe_output_without_url_is_an_error() {
        assert!(parse_probe_output("").is_err());
    }
}
