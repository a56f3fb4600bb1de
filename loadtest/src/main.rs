use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image proxy.
///
/// Expects the proxy's context directory to hold `bench/0.jpg` ..
/// `bench/{SOURCES - 1}.jpg`.
///
/// Scenarios:
/// - hot cache: the same few sources requested over and over
/// - negotiation: every browser flavour of `Accept` against one source
/// - cold start: many users asking for the same uncached variant at once,
///   which should cost one transcode per `(source, format)`
///
/// # Usage
/// ```bash
/// cd loadtest
/// cargo run --release -- --host http://localhost:7000 --users 20 --hatch-rate 5 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Cache hits: <20ms p95 latency
/// - Cache misses: <200ms p95 latency (WebP) / <400ms (AVIF)
/// - Error rate: <1%

const SOURCES: u32 = 50;

const ACCEPT_HEADERS: [&str; 4] = [
    "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8",
    "image/webp,*/*",
    "image/avif",
    "image/webp",
];

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("HotCache")
                .register_transaction(transaction!(hot_image).set_weight(15)?)
                .register_transaction(transaction!(negotiated_image).set_weight(5)?),
        )
        .register_scenario(
            scenario!("ColdStart")
                .register_transaction(transaction!(random_image).set_weight(10)?)
                .register_transaction(transaction!(rejected_accept).set_weight(1)?),
        )
        .execute()
        .await?;

    Ok(())
}

async fn get_image(user: &mut GooseUser, path: &str, accept: &str) -> TransactionResult {
    let request = user.get_request_builder(&GooseMethod::Get, path)?.header("Accept", accept);
    let goose_request = GooseRequest::builder().set_request_builder(request).build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}

/// A handful of sources, so nearly every request is a cache hit.
async fn hot_image(user: &mut GooseUser) -> TransactionResult {
    let path = {
        let mut rng = rand::thread_rng();
        format!("/?src=bench%2F{}.jpg", rng.gen_range(0..3))
    };
    get_image(user, &path, ACCEPT_HEADERS[0]).await
}

/// One source under every `Accept` flavour; each format is its own variant.
async fn negotiated_image(user: &mut GooseUser) -> TransactionResult {
    let accept = {
        let mut rng = rand::thread_rng();
        ACCEPT_HEADERS[rng.gen_range(0..ACCEPT_HEADERS.len())]
    };
    get_image(user, "/?src=bench%2F0.jpg", accept).await
}

/// Spread across every source. Early in the run most requests miss and
/// concurrent users collide on the same variant.
async fn random_image(user: &mut GooseUser) -> TransactionResult {
    let path = {
        let mut rng = rand::thread_rng();
        format!("/?src=bench%2F{}.jpg", rng.gen_range(0..SOURCES))
    };
    get_image(user, &path, ACCEPT_HEADERS[1]).await
}

/// Accept header with no offered format: measures the 406 fast path.
async fn rejected_accept(user: &mut GooseUser) -> TransactionResult {
    let request = user
        .get_request_builder(&GooseMethod::Get, "/?src=bench%2F0.jpg")?
        .header("Accept", "text/html");
    let goose_request = GooseRequest::builder()
        .set_request_builder(request)
        .expect_status_code(406)
        .build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}
