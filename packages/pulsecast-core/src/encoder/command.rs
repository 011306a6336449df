//! Encoder command-line construction.
//!
//! The argument lists are load-bearing: stream copy imposes keyframe-interval
//! preconditions on the input files, so the exact flag set (not just its
//! intent) is part of the external contract. Keep changes here in sync with
//! how the input assets are pre-encoded.

use std::path::{Path, PathBuf};

use crate::config::EncoderSettings;

/// What one encoder invocation streams.
#[derive(Debug, Clone)]
pub enum EncoderPlan {
    /// Concat-demux a prepared manifest of video assets, stream-copying both
    /// tracks.
    Concat {
        /// Absolute paths in playback order (already shuffled for random
        /// playlists). The manifest is derived from these.
        paths: Vec<PathBuf>,
        /// Infinite loop when true, play once when false.
        loop_playback: bool,
    },
    /// Loop one background video while playing a concat manifest of audio
    /// tracks, optionally mixing in an ambient sound bed.
    MusicPlaylist {
        background: PathBuf,
        tracks: Vec<PathBuf>,
        /// Ambient sound file and its mix volume (0.0..=1.0).
        ambient: Option<(PathBuf, f64)>,
    },
}

impl EncoderPlan {
    /// The paths the concat manifest must list for this plan.
    pub fn manifest_paths(&self) -> &[PathBuf] {
        match self {
            Self::Concat { paths, .. } => paths,
            Self::MusicPlaylist { tracks, .. } => tracks,
        }
    }
}

/// Builds the full RTMP output URL for a stream key.
pub fn rtmp_url(settings: &EncoderSettings, stream_key: &str) -> String {
    format!("{}/{}", settings.ingest_base_url, stream_key)
}

/// Builds the encoder argv (excluding the binary itself) for a plan whose
/// manifest has already been written.
pub fn build_args(
    settings: &EncoderSettings,
    plan: &EncoderPlan,
    manifest: &Path,
    stream_key: &str,
) -> Vec<String> {
    match plan {
        EncoderPlan::Concat { loop_playback, .. } => {
            build_concat_args(settings, manifest, *loop_playback, stream_key)
        }
        EncoderPlan::MusicPlaylist {
            background,
            ambient,
            ..
        } => build_music_args(settings, background, manifest, ambient.as_ref(), stream_key),
    }
}

fn build_concat_args(
    settings: &EncoderSettings,
    manifest: &Path,
    loop_playback: bool,
    stream_key: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".into(),
        "-loglevel".into(),
        "warning".into(),
        "-re".into(),
        "-fflags".into(),
        "+genpts+igndts".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-stream_loop".into(),
        if loop_playback { "-1" } else { "0" }.into(),
        "-i".into(),
        manifest.to_string_lossy().into_owned(),
        // Map only the first video and audio stream, dropping metadata and
        // cover-art streams that would otherwise leak into the FLV mux.
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a:0".into(),
        "-map_metadata".into(),
        "-1".into(),
        // Stream copy: inputs must be pre-encoded with a compliant keyframe
        // interval, there is no way to fix it up at this stage.
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        "-f".into(),
        "flv".into(),
        "-flvflags".into(),
        "no_duration_filesize".into(),
    ];
    args.push(rtmp_url(settings, stream_key));
    args
}

fn build_music_args(
    settings: &EncoderSettings,
    background: &Path,
    manifest: &Path,
    ambient: Option<&(PathBuf, f64)>,
    stream_key: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".into(),
        "-loglevel".into(),
        "warning".into(),
        "-fflags".into(),
        "+genpts+igndts".into(),
        // Input 0: looping background video, read at native rate.
        "-thread_queue_size".into(),
        "512".into(),
        "-stream_loop".into(),
        "-1".into(),
        "-re".into(),
        "-i".into(),
        background.to_string_lossy().into_owned(),
        // Input 1: looping music concat.
        "-thread_queue_size".into(),
        "512".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-stream_loop".into(),
        "-1".into(),
        "-i".into(),
        manifest.to_string_lossy().into_owned(),
    ];

    match ambient {
        Some((path, volume)) => {
            // Input 2: looping ambient bed, mixed under the music.
            args.extend([
                "-thread_queue_size".into(),
                "512".into(),
                "-stream_loop".into(),
                "-1".into(),
                "-i".into(),
                path.to_string_lossy().into_owned(),
                "-filter_complex".into(),
                format!(
                    "[1:a]volume=1.0[music];[2:a]volume={}[sfx];\
                     [music][sfx]amix=inputs=2:duration=longest[outa]",
                    volume
                ),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "[outa]".into(),
            ]);
        }
        None => {
            args.extend([
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a:0".into(),
            ]);
        }
    }

    args.extend([
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        settings.audio_bitrate.clone(),
        "-ar".into(),
        "44100".into(),
        "-ac".into(),
        "2".into(),
        "-f".into(),
        "flv".into(),
        "-flvflags".into(),
        "no_duration_filesize".into(),
    ]);
    args.push(rtmp_url(settings, stream_key));
    args
}

/// Renders an argv for logging with the stream key masked.
pub fn masked_command_line(binary: &Path, args: &[String], stream_key: &str) -> String {
    let mut line = binary.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        if stream_key.len() >= 4 && arg.contains(stream_key) {
            line.push_str(&arg.replace(stream_key, "****"));
        } else {
            line.push_str(arg);
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings::default()
    }

    #[test]
    fn concat_args_match_contract_exactly() {
        let args = build_args(
            &settings(),
            &EncoderPlan::Concat {
                paths: vec![PathBuf::from("/media/a.mp4")],
                loop_playback: true,
            },
            Path::new("/tmp/list.txt"),
            "key-1234",
        );
        let expected: Vec<String> = [
            "-nostdin", "-loglevel", "warning", "-re", "-fflags", "+genpts+igndts",
            "-f", "concat", "-safe", "0", "-stream_loop", "-1", "-i", "/tmp/list.txt",
            "-map", "0:v:0", "-map", "0:a:0", "-map_metadata", "-1",
            "-c:v", "copy", "-c:a", "copy",
            "-f", "flv", "-flvflags", "no_duration_filesize",
            "rtmp://a.rtmp.youtube.com/live2/key-1234",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn non_looping_concat_uses_zero_stream_loop() {
        let args = build_args(
            &settings(),
            &EncoderPlan::Concat {
                paths: vec![PathBuf::from("/media/a.mp4")],
                loop_playback: false,
            },
            Path::new("/tmp/list.txt"),
            "key-1234",
        );
        let i = args.iter().position(|a| a == "-stream_loop").unwrap();
        assert_eq!(args[i + 1], "0");
    }

    #[test]
    fn music_args_without_ambient_map_playlist_audio() {
        let args = build_args(
            &settings(),
            &EncoderPlan::MusicPlaylist {
                background: PathBuf::from("/media/bg.mp4"),
                tracks: vec![PathBuf::from("/media/track.mp3")],
                ambient: None,
            },
            Path::new("/tmp/music.txt"),
            "key-1234",
        );
        assert!(!args.iter().any(|a| a == "-filter_complex"));
        let maps: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-map")
            .map(|(i, _)| &args[i + 1])
            .collect();
        assert_eq!(maps, ["0:v:0", "1:a:0"]);
        // Audio is re-encoded for the mix path, never stream-copied.
        let i = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[i + 1], "aac");
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "44100"));
    }

    #[test]
    fn music_args_with_ambient_build_amix_graph() {
        let args = build_args(
            &settings(),
            &EncoderPlan::MusicPlaylist {
                background: PathBuf::from("/media/bg.mp4"),
                tracks: vec![PathBuf::from("/media/track.mp3")],
                ambient: Some((PathBuf::from("/media/rain.mp3"), 0.3)),
            },
            Path::new("/tmp/music.txt"),
            "key-1234",
        );
        let i = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert_eq!(
            args[i + 1],
            "[1:a]volume=1.0[music];[2:a]volume=0.3[sfx];[music][sfx]amix=inputs=2:duration=longest[outa]"
        );
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "[outa]"));
        // Three inputs, each with its own thread queue.
        assert_eq!(args.iter().filter(|a| *a == "-thread_queue_size").count(), 3);
    }

    #[test]
    fn masked_command_line_hides_the_key() {
        let args = build_args(
            &settings(),
            &EncoderPlan::Concat {
                paths: vec![PathBuf::from("/media/a.mp4")],
                loop_playback: true,
            },
            Path::new("/tmp/list.txt"),
            "secret-key",
        );
        let line = masked_command_line(Path::new("ffmpeg"), &args, "secret-key");
        assert!(!line.contains("secret-key"));
        assert!(line.contains("rtmp://a.rtmp.youtube.com/live2/****"));
    }
}
