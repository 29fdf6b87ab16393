use std::time::Duration;

use fundex_adapters::{
    identity_source_for, map_rate, AdapterError, FundApiClient, HowbuyRankingSource,
    IdentitySource, SourceKind,
};
use fundex_core::{ListedFund, NameSide, Payload};
use fundex_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quiet_http() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        max_pacing: Duration::ZERO,
        ..Default::default()
    })
    .expect("fetcher")
}

async fn mount_ranking_page(server: &MockServer, page: u32, codes: &[&str]) {
    let list: Vec<_> = codes
        .iter()
        .map(|code| json!({ "jjdm": code, "jjjc": format!("fund {code}") }))
        .collect();
    Mock::given(method("POST"))
        .and(path("/ranking"))
        .and(body_string_contains(format!("page={page}&")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "list": list })))
        .expect(1)
        .mount(server)
        .await;
}

fn api(server: &MockServer) -> FundApiClient {
    FundApiClient::new(
        format!("{}/detail?FCODE={{code}}", server.uri()),
        format!("{}/rate?FCODE={{code}}", server.uri()),
    )
}

#[tokio::test]
async fn ranking_pages_until_an_empty_page() {
    let server = MockServer::start().await;
    mount_ranking_page(&server, 1, &["000001", "000002"]).await;
    mount_ranking_page(&server, 2, &["000003"]).await;
    mount_ranking_page(&server, 3, &["000004", "000005"]).await;
    mount_ranking_page(&server, 4, &[]).await;

    let source = identity_source_for(
        "howbuy-ranking",
        SourceKind::HowbuyRanking,
        &format!("{}/ranking", server.uri()),
    );
    assert_eq!(source.side(), NameSide::Howbuy);

    let http = quiet_http();
    let mut pages = Vec::new();
    for page in 1u32.. {
        let funds = source.fetch_page(&http, page).await.expect("page");
        if funds.is_empty() {
            break;
        }
        pages.push(funds);
    }
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[1], vec![ListedFund::new("000003", "fund 000003")]);
    assert_eq!(server.received_requests().await.expect("recorded").len(), 4);
}

#[tokio::test]
async fn ranking_entry_with_null_name_is_listed_unnamed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ranking"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "list": [{ "jjdm": "000001", "jjjc": null }, { "jjdm": "000002", "jjjc": "fund 2" }]
        })))
        .mount(&server)
        .await;

    let source = HowbuyRankingSource::new("howbuy-ranking", format!("{}/ranking", server.uri()));
    let funds = source.fetch_page(&quiet_http(), 1).await.expect("page");
    assert_eq!(
        funds,
        vec![ListedFund::unnamed("000001"), ListedFund::new("000002", "fund 2")]
    );
}

#[tokio::test]
async fn ranking_page_without_list_is_a_decode_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "busy" })))
        .mount(&server)
        .await;

    let source = HowbuyRankingSource::new("howbuy-ranking", format!("{}/ranking", server.uri()));
    let err = source.fetch_page(&quiet_http(), 1).await.unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(FetchError::Envelope { .. })));
    assert!(!err.is_network());
}

#[tokio::test]
async fn suggest_list_is_one_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/FundSuggestList.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
            "var FundSuggest={",
            r#""Datas":["000001|HXCZ|华夏成长混合|混合型|HXCZHH"]"#,
            "};\n\n"
        )))
        .expect(1)
        .mount(&server)
        .await;

    let source = identity_source_for(
        "eastmoney-suggest",
        SourceKind::EastmoneySuggest,
        &format!("{}/FundSuggestList.js", server.uri()),
    );
    let http = quiet_http();
    let first = source.fetch_page(&http, 1).await.expect("page 1");
    assert_eq!(first, vec![ListedFund::new("000001", "华夏成长混合")]);
    assert!(source.fetch_page(&http, 2).await.expect("page 2").is_empty());
}

#[tokio::test]
async fn null_datas_is_an_empty_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/detail"))
        .and(query_param("FCODE", "000404"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Datas": null, "ErrCode": 0 })))
        .expect(1)
        .mount(&server)
        .await;

    let payload = api(&server)
        .fetch_detail(&quiet_http(), "000404")
        .await
        .expect("payload");
    assert_eq!(payload, Payload::Empty);
}

#[tokio::test]
async fn missing_or_falsy_datas_is_an_empty_payload() {
    let server = MockServer::start().await;
    let bodies = [
        ("000001", json!({ "ErrCode": 1 })),
        ("000002", json!({ "Datas": "" })),
        ("000003", json!({ "Datas": [] })),
        ("000004", json!({ "Datas": 0 })),
    ];
    for (code, body) in &bodies {
        Mock::given(method("GET"))
            .and(path("/detail"))
            .and(query_param("FCODE", *code))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let client = api(&server);
    let http = quiet_http();
    for (code, _) in &bodies {
        let payload = client.fetch_detail(&http, code).await.expect("payload");
        assert_eq!(payload, Payload::Empty, "{code}");
    }
}

#[tokio::test]
async fn non_object_datas_is_a_decode_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Datas": ["000001"] })))
        .mount(&server)
        .await;

    let err = api(&server)
        .fetch_detail(&quiet_http(), "000001")
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(FetchError::Envelope { .. })));
}

#[tokio::test]
async fn non_json_detail_is_a_decode_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/detail"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>rate limited</html>"))
        .mount(&server)
        .await;

    let err = api(&server)
        .fetch_detail(&quiet_http(), "000001")
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(FetchError::Decode { .. })));
    assert!(!err.is_network());
}

#[tokio::test]
async fn rate_payload_maps_after_fetch() {
    let server = MockServer::start().await;
    let mut datas = serde_json::Map::new();
    for key in fundex_core::RATE_ATTRIBUTE_KEYS {
        datas.insert(key.to_string(), json!(null));
    }
    datas.insert("MINSG".into(), json!("10"));
    datas.insert("DTZT".into(), json!(" 0 "));
    datas.insert(
        "sg".into(),
        json!([
            { "money": "小于100万", "rate": "1.50%" },
            { "money": "大于等于100万", "rate": "1000元" }
        ]),
    );
    datas.insert("sh".into(), json!(null));
    Mock::given(method("GET"))
        .and(path("/rate"))
        .and(query_param("FCODE", "000001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Datas": datas })))
        .expect(1)
        .mount(&server)
        .await;

    let payload = api(&server)
        .fetch_rate(&quiet_http(), "000001")
        .await
        .expect("payload");
    let Payload::Present(raw) = payload else {
        panic!("expected a present payload");
    };
    let update = map_rate(&raw).expect("map");
    assert!(!update.installment_enabled);
    assert_eq!(update.dropped_tiers(), 0);
    assert!(update.redemption.is_none());
    let subscription = update.subscription.expect("tiers");
    assert_eq!(
        subscription.named_fields()[3],
        ("sg_rate2".to_string(), Some("1000元".to_string()))
    );
}
