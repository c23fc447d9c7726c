//! File download over the shared client.
//!
//! Large bodies (> 2 MiB) are fetched as parallel 1 MiB range requests into
//! a pre-sized file; small bodies in one shot. WebP payloads destined for a
//! `.jpg` path are re-encoded as JPEG.

use std::io::Cursor;
use std::path::Path;

use futures::stream::{self, StreamExt};
use http::Method;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{AvWebClient, RequestOptions, WebError, WebResult};

const MIB: u64 = 1024 * 1024;
/// Bodies above this size are downloaded in parallel chunks.
const CHUNK_THRESHOLD: u64 = 2 * MIB;
const CHUNK_SIZE: u64 = MIB;
const CHUNK_CONCURRENCY: usize = 10;
const JPEG_QUALITY: u8 = 95;

impl AvWebClient {
    /// Download `url` to `path`.
    pub async fn download(&self, url: &str, path: &Path) -> WebResult<()> {
        let size = self.head_size(url).await;
        let webp_to_jpg =
            path.extension().is_some_and(|ext| ext == "jpg") && url.contains(".webp");

        if let Some(size) = size {
            if size > CHUNK_THRESHOLD && !webp_to_jpg {
                return self.download_chunks(url, path, size).await;
            }
        }

        let body = self.get_bytes(url, RequestOptions::default()).await?;
        if webp_to_jpg {
            let jpeg = reencode_jpeg(body.to_vec()).await?;
            tokio::fs::write(path, jpeg).await?;
        } else {
            tokio::fs::write(path, &body).await?;
        }
        Ok(())
    }

    async fn download_chunks(&self, url: &str, path: &Path, size: u64) -> WebResult<()> {
        let file = tokio::fs::File::create(path).await?;
        file.set_len(size).await?;
        drop(file);

        let mut ranges = Vec::new();
        let mut start = 0;
        while start < size {
            let end = (start + CHUNK_SIZE).min(size);
            ranges.push((start, end));
            start = end;
        }
        log::debug!("📦 chunked download: {url} ({} chunks, {size} bytes)", ranges.len());

        let results: Vec<WebResult<()>> = stream::iter(ranges)
            .map(|(start, end)| self.fetch_chunk(url, path, start, end))
            .buffer_unordered(CHUNK_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect::<WebResult<Vec<()>>>()?;
        Ok(())
    }

    async fn fetch_chunk(&self, url: &str, path: &Path, start: u64, end: u64) -> WebResult<()> {
        let mut opts = RequestOptions::default();
        opts.headers
            .insert("Range".to_string(), format!("bytes={start}-{}", end - 1));
        let response = self.request(Method::GET, url, opts).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        file.write_all(response.bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Decode any raster payload and re-encode as JPEG (quality 95). Runs on
/// the blocking pool.
async fn reencode_jpeg(body: Vec<u8>) -> WebResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let decoded = image::load_from_memory(&body)
            .map_err(|err| WebError::Decode(format!("image decode: {err}")))?;
        let rgb = decoded.to_rgb8();
        let mut out = Cursor::new(Vec::new());
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        rgb.write_with_encoder(encoder)
            .map_err(|err| WebError::Decode(format!("jpeg encode: {err}")))?;
        Ok(out.into_inner())
    })
    .await
    .map_err(|err| WebError::Transport(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use std::sync::Arc;

    fn client() -> AvWebClient {
        let config = Config::builder().with_retry(0).build();
        AvWebClient::with_events(&config, Arc::new(EventBus::silent())).unwrap()
    }

    #[tokio::test]
    async fn small_files_download_in_one_shot() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/small.bin")
            .with_status(200)
            .with_header("content-length", "5")
            .create_async()
            .await;
        server
            .mock("GET", "/small.bin")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let dir = std::env::temp_dir().join("avmeta-test-small");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("small.bin");

        client()
            .download(&format!("{}/small.bin", server.url()), &path)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn large_files_use_range_requests() {
        let size = 3 * MIB as usize;
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/large.bin")
            .with_status(200)
            .with_header("content-length", &size.to_string())
            .create_async()
            .await;
        // One mock per expected chunk, matched on the Range header.
        for (index, start) in (0..size).step_by(MIB as usize).enumerate() {
            let end = (start + MIB as usize).min(size);
            server
                .mock("GET", "/large.bin")
                .match_header("range", format!("bytes={start}-{}", end - 1).as_str())
                .with_status(206)
                .with_body(&body[start..end])
                .create_async()
                .await;
            let _ = index;
        }

        let dir = std::env::temp_dir().join("avmeta-test-large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("large.bin");

        client()
            .download(&format!("{}/large.bin", server.url()), &path)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn webp_body_reencodes_to_jpeg_for_jpg_paths() {
        // Any decodable raster works for the re-encode path; PNG keeps the
        // fixture tiny.
        let mut png = Cursor::new(Vec::new());
        image::RgbImage::from_pixel(4, 4, image::Rgb([200, 30, 30]))
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", mockito::Matcher::Regex("^/cover".into()))
            .with_status(200)
            .with_header("content-length", &png.get_ref().len().to_string())
            .create_async()
            .await;
        server
            .mock("GET", mockito::Matcher::Regex("^/cover".into()))
            .with_status(200)
            .with_body(png.get_ref().clone())
            .create_async()
            .await;

        let dir = std::env::temp_dir().join("avmeta-test-webp");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cover.jpg");

        client()
            .download(&format!("{}/cover.webp", server.url()), &path)
            .await
            .unwrap();
        let saved = std::fs::read(&path).unwrap();
        assert_eq!(&saved[..2], &[0xFF, 0xD8], "expected JPEG magic");
        let _ = std::fs::remove_file(&path);
    }
}
