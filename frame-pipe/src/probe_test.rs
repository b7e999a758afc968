use std::time::Duration;

use super::{MediaProbe, UNSUPPORTED_SIDE_CODECS, parse_rate, parse_seconds};

const SAMPLE: &str = r#"{
    "streams": [
        {
            "index": 0,
            "codec_name": "h264",
            "codec_type": "video",
            "width": 1280,
            "height": 720,
            "r_frame_rate": "24/1",
            "avg_frame_rate": "24/1",
            "duration": "1.000000",
            "nb_frames": "24"
        },
        {
            "index": 1,
            "codec_name": "aac",
            "codec_type": "audio",
            "avg_frame_rate": "0/0",
            "duration": "1.021333"
        },
        {
            "index": 2,
            "codec_name": "dvd_subtitle",
            "codec_type": "subtitle",
            "avg_frame_rate": "0/0"
        },
        {
            "index": 3,
            "codec_name": "subrip",
            "codec_type": "subtitle"
        }
    ],
    "format": {
        "filename": "in.mkv",
        "nb_streams": 4,
        "format_name": "matroska,webm",
        "duration": "1.021333"
    }
}"#;

// ------------------------------------------------------------------------
// Rational / duration parsing
// ------------------------------------------------------------------------

#[test]
fn test_parse_rate() {
    assert_eq!(parse_rate("24/1"), 24.0);
    assert!((parse_rate("30000/1001") - 29.97).abs() < 0.01);
    assert_eq!(parse_rate("25"), 25.0);
    assert_eq!(parse_rate(" 12.5 "), 12.5);
}

#[test]
fn test_parse_rate_malformed_is_zero() {
    assert_eq!(parse_rate("24/0"), 0.0);
    assert_eq!(parse_rate("0/0"), 0.0);
    assert_eq!(parse_rate("abc/2"), 0.0);
    assert_eq!(parse_rate("/5"), 0.0);
    assert_eq!(parse_rate("5/"), 0.0);
    assert_eq!(parse_rate(""), 0.0);
    assert_eq!(parse_rate("N/A"), 0.0);
}

#[test]
fn test_parse_seconds() {
    assert_eq!(parse_seconds("1.500000"), 1.5);
    assert_eq!(parse_seconds("0:01:02.500000"), 62.5);
    assert_eq!(parse_seconds("N/A"), 0.0);
    assert_eq!(parse_seconds("1:xx:00"), 0.0);
    assert_eq!(parse_seconds("-3"), 0.0);
}

// ------------------------------------------------------------------------
// MediaProbe
// ------------------------------------------------------------------------

#[test]
fn test_probe_from_json() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(SAMPLE)?;
    assert_eq!(probe.streams.len(), 4);
    assert_eq!(probe.format.nb_streams, 4);

    let video = probe.video_stream().expect("video stream");
    assert_eq!(video.index, 0);
    assert_eq!(video.nb_frames, Some(24));
    assert_eq!(video.width, Some(1280));

    assert_eq!(probe.duration(), Duration::from_secs(1));
    assert_eq!(probe.frame_rate(), 24.0);
    assert_eq!(probe.expected_frames(), 24);
    Ok(())
}

#[test]
fn test_duration_falls_back_to_format() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(
        r#"{"streams":[{"index":0,"codec_type":"video","avg_frame_rate":"10/1"}],
            "format":{"duration":"2.5"}}"#,
    )?;
    assert_eq!(probe.duration(), Duration::from_millis(2500));
    assert_eq!(probe.expected_frames(), 25);
    Ok(())
}

#[test]
fn test_expected_frames_without_rate_is_zero() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(
        r#"{"streams":[{"index":0,"codec_type":"video","avg_frame_rate":"24/0"}],
            "format":{"duration":"3.0"}}"#,
    )?;
    assert_eq!(probe.frame_rate(), 0.0);
    assert_eq!(probe.expected_frames(), 0);
    Ok(())
}

#[test]
fn test_side_streams_skip_video_and_excluded() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(SAMPLE)?;
    let excluded: Vec<String> = UNSUPPORTED_SIDE_CODECS.iter().map(|c| c.to_string()).collect();
    let indices: Vec<u32> = probe.side_streams(&excluded).map(|s| s.index).collect();
    assert_eq!(indices, vec![1, 3]);
    Ok(())
}

#[test]
fn test_probe_round_trips_through_serde() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(SAMPLE)?;
    let json = serde_json::to_string(&probe)?;
    let back = MediaProbe::from_json(&json)?;
    assert_eq!(back.expected_frames(), 24);
    assert_eq!(back.streams[1].codec_name, "aac");
    Ok(())
}

#[test]
fn test_display_lists_streams() -> anyhow::Result<()> {
    let probe = MediaProbe::from_json(SAMPLE)?;
    let text = probe.to_string();
    assert!(text.starts_with("[FORMAT]"));
    assert_eq!(text.matches("[STREAM]").count(), 4);
    assert!(text.contains("size=1280x720"));
    Ok(())
}
