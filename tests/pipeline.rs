//! End-to-end pipeline tests against a local HTTP server.
//!
//! These exercise the full Search→Detail→post-process→merge path over real
//! HTTP, with the site base URLs pointed at mockito.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use avmeta::config::FieldPriorities;
use avmeta::crawlers::javbus::JavbusCrawler;
use avmeta::crawlers::missav::MissavCrawler;
use avmeta::{
    AvWebClient, Config, CrawlerInput, EventBus, Field, ScrapeEngine, SiteCrawler, Website,
};

fn test_config(priorities: FieldPriorities) -> Config {
    Config::builder()
        .with_retry(0)
        .with_timeout(Duration::from_secs(5))
        .with_field_priorities(priorities)
        .build()
}

fn engine_with(
    config: Config,
    crawlers: HashMap<Website, Arc<dyn SiteCrawler>>,
    client: Arc<AvWebClient>,
    events: Arc<EventBus>,
) -> ScrapeEngine {
    ScrapeEngine::from_parts(config, client, crawlers, events)
}

const JAVBUS_DETAIL: &str = r#"<html><body><div class="container">
  <h3>ABC-123 パイプラインテスト</h3>
  <div class="info">
    <p><span class="header">識別碼:</span> ABC-123</p>
    <p><span class="header">發行日期:</span> 2024-01-02</p>
    <p><span class="header">長度:</span> 150分鐘</p>
    <p><span class="header">製作商:</span> テスト制作</p>
    <p class="genre"><a href="/genre/1">単体作品</a></p>
  </div>
  <div class="star-name"><a href="/star/x">花咲いあん</a></div>
  <a class="bigImage" href="/pics/abc123_b.jpg"><img src="/pics/abc123_b.jpg"/></a>
</div></body></html>"#;

#[tokio::test]
async fn javbus_lookup_produces_a_merged_record() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/ABC-123")
        .with_status(200)
        .with_body(JAVBUS_DETAIL)
        .create_async()
        .await;

    let mut priorities = FieldPriorities::new();
    for &field in Field::ALL {
        priorities.set(field, vec![Website::Javbus]);
    }
    let config = test_config(priorities);
    let events = Arc::new(EventBus::silent());
    let client = Arc::new(AvWebClient::with_events(&config, events.clone()).unwrap());

    let mut crawlers: HashMap<Website, Arc<dyn SiteCrawler>> = HashMap::new();
    crawlers.insert(
        Website::Javbus,
        Arc::new(JavbusCrawler::new(client.clone(), server.url())),
    );
    let engine = engine_with(config, crawlers, client, events);

    let record = engine
        .call_crawlers(&CrawlerInput::from_number("ABC-123"))
        .await
        .expect("lookup should succeed");

    assert_eq!(record.data.number, "ABC-123");
    assert_eq!(record.data.title, "パイプラインテスト");
    assert_eq!(record.data.release, "2024-01-02");
    assert_eq!(record.data.year, "2024");
    assert_eq!(record.data.runtime, "150");
    assert_eq!(record.data.actors, vec!["花咲いあん"]);
    assert_eq!(record.source_of(Field::Title), Some(Website::Javbus));
    assert!(record.data.thumb.ends_with("/pics/abc123_b.jpg"));
    // The poster backfills from the cover when the site has no portrait.
    assert_eq!(record.data.poster, record.data.thumb);
}

#[tokio::test]
async fn repeated_lookups_return_structurally_equal_records() {
    let mut server = mockito::Server::new_async().await;
    let detail = server
        .mock("GET", "/IDEM-001")
        .with_status(200)
        .with_body(JAVBUS_DETAIL.replace("ABC-123", "IDEM-001"))
        .expect(1)
        .create_async()
        .await;

    let mut priorities = FieldPriorities::new();
    priorities.set(Field::Number, vec![Website::Javbus]);
    priorities.set(Field::Title, vec![Website::Javbus]);
    priorities.set(Field::Release, vec![Website::Javbus]);
    let config = test_config(priorities);
    let events = Arc::new(EventBus::silent());
    let client = Arc::new(AvWebClient::with_events(&config, events.clone()).unwrap());

    let mut crawlers: HashMap<Website, Arc<dyn SiteCrawler>> = HashMap::new();
    crawlers.insert(
        Website::Javbus,
        Arc::new(JavbusCrawler::new(client.clone(), server.url())),
    );
    let engine = engine_with(config, crawlers, client, events);

    let input = CrawlerInput::from_number("IDEM-001");
    let first = engine.call_crawlers(&input).await.unwrap();
    let second = engine.call_crawlers(&input).await.unwrap();
    assert_eq!(first, second);
    detail.assert_async().await;
}

#[tokio::test]
async fn missav_soft_404_fails_the_site_and_the_lookup() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/GONE-001/cn")
        .with_status(200)
        .with_body(
            r#"<html><head>
              <meta property="og:title" content="MissAV | 免費高清AV在線看" />
              <meta property="og:image" content="https://missav.ws/missav/logo-square.png" />
            </head><body><p>404</p><h1>找不到頁面</h1></body></html>"#,
        )
        .create_async()
        .await;

    let mut priorities = FieldPriorities::new();
    priorities.set(Field::Title, vec![Website::Missav]);
    let config = test_config(priorities);
    let events = Arc::new(EventBus::silent());
    let client = Arc::new(AvWebClient::with_events(&config, events.clone()).unwrap());

    let mut crawlers: HashMap<Website, Arc<dyn SiteCrawler>> = HashMap::new();
    crawlers.insert(
        Website::Missav,
        Arc::new(MissavCrawler::new(client.clone(), server.url())),
    );
    let engine = engine_with(config, crawlers, client, events);

    let record = engine
        .call_crawlers(&CrawlerInput::from_number("GONE-001"))
        .await;
    assert!(record.is_none());
}
