//! HTTP client behaviour against a loopback server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use erasefe::ops::ai::{HttpInpaintClient, InpaintClient, RemoteError, encode_png_base64};
use image::{ColorType, GrayImage, Luma, Rgba, RgbaImage};

struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.into_bytes(),
        }
    }
}

/// Read one HTTP/1.1 request: request line plus body.
fn read_request(stream: &mut std::net::TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    let request_line = head.lines().next().unwrap_or_default().to_string();
    (request_line, buf[header_end..header_end + length].to_vec())
}

/// Serve `replies` to consecutive connections, handing each request back.
fn serve(replies: Vec<Reply>) -> (String, mpsc::Receiver<(String, Vec<u8>)>) {
    serve_with(|_| replies)
}

/// Like [`serve`], but the replies may refer to the server's own address.
fn serve_with(
    make_replies: impl FnOnce(&str) -> Vec<Reply>,
) -> (String, mpsc::Receiver<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let replies = make_replies(&base);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for reply in replies {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            let _ = tx.send(request);
            let head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.status,
                reply.content_type,
                reply.body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&reply.body).unwrap();
        }
    });
    (base, rx)
}

fn inputs() -> (RgbaImage, GrayImage) {
    let image = RgbaImage::from_pixel(8, 6, Rgba([10, 20, 30, 255]));
    let mut mask = GrayImage::new(8, 6);
    mask.put_pixel(3, 3, Luma([255]));
    (image, mask)
}

fn client(base: &str) -> HttpInpaintClient {
    HttpInpaintClient::new(format!("{}/api/inpaint", base), Duration::from_secs(5)).unwrap()
}

#[test]
fn success_with_data_url_result() {
    let result = RgbaImage::from_pixel(8, 6, Rgba([200, 10, 10, 255]));
    let b64 = encode_png_base64(result.as_raw(), 8, 6, ColorType::Rgba8).unwrap();
    let (base, requests) = serve(vec![Reply::json(
        200,
        format!(r#"{{"imageUrl":"data:image/png;base64,{}","remaining":4}}"#, b64),
    )]);

    let (image, mask) = inputs();
    let reply = client(&base).inpaint(&image, &mask).unwrap();
    assert_eq!(reply.image, result);
    assert_eq!(reply.remaining, 4);

    let (line, body) = requests.recv().unwrap();
    assert!(line.starts_with("POST /api/inpaint"));
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let mask_png = BASE64.decode(json["mask"].as_str().unwrap()).unwrap();
    let sent_mask = image::load_from_memory(&mask_png).unwrap().to_luma8();
    assert_eq!(sent_mask, mask);
    assert!(json["image"].as_str().is_some());
}

#[test]
fn success_with_http_result_is_fetched() {
    let result = RgbaImage::from_pixel(8, 6, Rgba([1, 2, 3, 255]));
    let b64 = encode_png_base64(result.as_raw(), 8, 6, ColorType::Rgba8).unwrap();
    let png = BASE64.decode(b64).unwrap();

    let (base, requests) = serve_with(|base| {
        vec![
            Reply::json(200, format!(r#"{{"imageUrl":"{}/result.png","remaining":2}}"#, base)),
            Reply {
                status: 200,
                content_type: "image/png",
                body: png,
            },
        ]
    });

    let (image, mask) = inputs();
    let reply = client(&base).inpaint(&image, &mask).unwrap();
    assert_eq!(reply.image, result);
    assert_eq!(reply.remaining, 2);
    assert!(requests.recv().unwrap().0.starts_with("POST /api/inpaint"));
    assert!(requests.recv().unwrap().0.starts_with("GET /result.png"));
}

#[test]
fn status_codes_map_to_errors() {
    let (base, _requests) = serve(vec![
        Reply::json(429, r#"{"error":"rate_limited","message":"Come back tomorrow"}"#.into()),
        Reply::json(503, r#"{"error":"not configured"}"#.into()),
        Reply::json(500, "oops".into()),
        Reply::json(200, r#"{"unexpected":true}"#.into()),
    ]);
    let (image, mask) = inputs();
    let c = client(&base);

    assert_eq!(
        c.inpaint(&image, &mask).unwrap_err(),
        RemoteError::RateLimited("Come back tomorrow".into())
    );
    assert_eq!(c.inpaint(&image, &mask).unwrap_err(), RemoteError::NotConfigured);
    assert_eq!(c.inpaint(&image, &mask).unwrap_err(), RemoteError::Http(500));
    assert!(matches!(c.inpaint(&image, &mask).unwrap_err(), RemoteError::Malformed(_)));
}

#[test]
fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_request(&mut stream);
        thread::sleep(Duration::from_secs(3));
    });

    let (image, mask) = inputs();
    let c = HttpInpaintClient::new(format!("{}/api/inpaint", base), Duration::from_millis(300)).unwrap();
    assert_eq!(c.inpaint(&image, &mask).unwrap_err(), RemoteError::Timeout);
}
