//! Crate-level integration tests driving the `Pipeline` public API end to
//! end over a real loopback HTTP server (SPEC_FULL §8.1), rather than
//! synthetic unit-level calls. Covers scenario 1 ("VOD ladder, single
//! pass") and the §7 fatal-initial-fetch error path.

use std::sync::Arc;

use hls::{ClientState, Fetcher, HlsError, HlsOrchestratorConfig, Pipeline, PipelineEvent, Playlist};
use tokio_util::sync::CancellationToken;

const MEDIA_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:10.0,\nseg0.ts\n\
#EXTINF:10.0,\nseg1.ts\n\
#EXT-X-ENDLIST\n";

/// Serves fixed responses over raw HTTP/1.1 on a loopback socket, one
/// request per connection, for as long as the test needs it.
fn spawn_fixture_server() -> std::net::SocketAddr {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();

            let (status, body): (&str, &[u8]) = match path.as_str() {
                "/media.m3u8" => ("200 OK", MEDIA_PLAYLIST.as_bytes()),
                "/seg0.ts" => ("200 OK", b"segment-zero-bytes"),
                "/seg1.ts" => ("200 OK", b"segment-one-bytes"),
                _ => ("404 Not Found", b"not found"),
            };
            let header =
                format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(body);
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
    });

    addr
}

#[tokio::test]
async fn pipeline_streams_vod_segments_in_order_then_eos() {
    // Scenario 1 (VOD ladder single pass), simplified to a single
    // already-loaded media variant: no adaptation switch is expected
    // since an empty ladder is passed.
    let addr = spawn_fixture_server();
    let playlist_uri = url::Url::parse(&format!("http://{addr}/media.m3u8")).unwrap();

    let Playlist::Media(variant) = hls::playlist::parse(MEDIA_PLAYLIST.as_bytes(), &playlist_uri).unwrap()
    else {
        panic!("expected media playlist");
    };
    let client = ClientState::start_vod(variant);

    let token = CancellationToken::new();
    let fetcher = Arc::new(Fetcher::new(reqwest::Client::new(), token.clone()));
    let pipeline = Pipeline::new(HlsOrchestratorConfig::default(), fetcher).unwrap();
    let mut rx = pipeline.run(client, Vec::new(), token);

    let mut received = Vec::new();
    loop {
        match rx.recv().await.expect("channel closed before Eos") {
            PipelineEvent::Segment(seg) => received.push(seg),
            PipelineEvent::VariantChanged { .. } => {}
            PipelineEvent::Error(e) => panic!("unexpected pipeline error: {e}"),
            PipelineEvent::Eos => break,
        }
    }

    assert_eq!(received.len(), 2);
    assert_eq!(received[0].bytes.as_ref(), b"segment-zero-bytes");
    assert_eq!(received[1].bytes.as_ref(), b"segment-one-bytes");
    assert!(!received[0].discontinuous);
}

#[tokio::test]
async fn pipeline_surfaces_fatal_error_when_initial_fragment_fetch_fails() {
    // §7: "initial-cache failure (fatal to pipeline)" must be
    // distinguishable from a graceful Eos, not silently collapsed into one.
    let addr = spawn_fixture_server();
    let playlist_uri = url::Url::parse(&format!("http://{addr}/media.m3u8")).unwrap();
    let media = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:10.0,\nmissing.ts\n#EXT-X-ENDLIST\n";

    let Playlist::Media(variant) = hls::playlist::parse(media.as_bytes(), &playlist_uri).unwrap() else {
        panic!("expected media playlist");
    };
    let client = ClientState::start_vod(variant);

    let token = CancellationToken::new();
    let fetcher = Arc::new(Fetcher::new(reqwest::Client::new(), token.clone()));
    let pipeline = Pipeline::new(HlsOrchestratorConfig::default(), fetcher).unwrap();
    let mut rx = pipeline.run(client, Vec::new(), token);

    let mut saw_error = false;
    loop {
        match rx.recv().await.expect("channel closed before Eos") {
            PipelineEvent::Segment(_) | PipelineEvent::VariantChanged { .. } => {}
            PipelineEvent::Error(e) => {
                assert!(matches!(e, HlsError::FragmentFetchFailed { .. }));
                saw_error = true;
            }
            PipelineEvent::Eos => break,
        }
    }
    assert!(saw_error, "expected a PipelineEvent::Error before Eos");
}
