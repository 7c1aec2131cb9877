// Endpoint categories and the synthetic payload shape for each
use chrono::Utc;
use phf::phf_map;
use serde_json::{json, Value};
use url::Url;

/// Seed USD prices for synthesized market data
static SEED_PRICES: phf::Map<&'static str, f64> = phf_map! {
    "BTC" => 43250.0,
    "ETH" => 2280.0,
    "SOL" => 98.5,
    "BNB" => 310.0,
    "XRP" => 0.62,
    "ADA" => 0.58,
    "DOGE" => 0.085,
    "DOT" => 7.4,
    "AVAX" => 36.0,
    "MATIC" => 0.92,
    "USDC" => 1.0,
    "USDT" => 1.0,
};

/// Provider coin ids mapped to ticker symbols
static COIN_IDS: phf::Map<&'static str, &'static str> = phf_map! {
    "bitcoin" => "BTC",
    "ethereum" => "ETH",
    "solana" => "SOL",
    "binancecoin" => "BNB",
    "ripple" => "XRP",
    "cardano" => "ADA",
    "dogecoin" => "DOGE",
    "polkadot" => "DOT",
    "avalanche-2" => "AVAX",
    "matic-network" => "MATIC",
    "usd-coin" => "USDC",
    "tether" => "USDT",
};

/// Units of quote currency per USD
static QUOTE_RATES: phf::Map<&'static str, f64> = phf_map! {
    "usd" => 1.0,
    "usdt" => 1.0,
    "usdc" => 1.0,
    "eur" => 0.92,
    "gbp" => 0.79,
};

const QUOTE_SUFFIXES: [&str; 5] = ["USDT", "USDC", "BUSD", "USD", "EUR"];
const SYMBOL_PARAMS: [&str; 11] = [
    "ids", "symbols", "symbol", "coin", "coins", "pair", "pairs", "product_id", "instrument",
    "asset", "market",
];
const DEFAULT_SYMBOL: &str = "BTC";

/// Well-known endpoint shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointCategory {
    PriceQuote,
    Candles,
    OrderBook,
    AccountBalance,
    RecentTrades,
    MarketSummary,
    Unknown,
}

impl EndpointCategory {
    /// Detect the category from the endpoint path
    pub fn from_endpoint(endpoint: &str) -> Self {
        let path = parse(endpoint).0;
        let has = |needles: &[&str]| contains_any(&path, needles);

        if has(&["ohlc", "candle", "kline"]) {
            EndpointCategory::Candles
        } else if has(&["orderbook", "order_book", "depth", "/book"]) {
            EndpointCategory::OrderBook
        } else if has(&["balance", "account", "portfolio", "wallet"]) {
            EndpointCategory::AccountBalance
        } else if has(&["trades", "fills"]) {
            EndpointCategory::RecentTrades
        } else if has(&["summary", "markets", "tickers", "overview"]) {
            EndpointCategory::MarketSummary
        } else if has(&["price", "quote", "ticker"]) {
            EndpointCategory::PriceQuote
        } else {
            EndpointCategory::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::PriceQuote => "price_quote",
            EndpointCategory::Candles => "candles",
            EndpointCategory::OrderBook => "order_book",
            EndpointCategory::AccountBalance => "account_balance",
            EndpointCategory::RecentTrades => "recent_trades",
            EndpointCategory::MarketSummary => "market_summary",
            EndpointCategory::Unknown => "unknown",
        }
    }
}

/// A requested asset resolved against the seed table
#[derive(Debug, Clone, PartialEq)]
struct Requested {
    /// Key as the caller spelled it (`bitcoin`, `BTCUSDT`, ...)
    key: String,
    symbol: &'static str,
    price: f64,
}

/// Build the synthetic payload for `category`, `None` for unknown shapes
pub fn synthetic_payload(category: EndpointCategory, endpoint: &str) -> Option<Value> {
    let (path, params) = parse(endpoint);
    let requested = requested_assets(&path, &params);
    let now = Utc::now();

    let primary = requested.first().cloned().unwrap_or_else(default_asset);

    let value = match category {
        EndpointCategory::PriceQuote => {
            let quotes = quote_currencies(&params);
            let assets = if requested.is_empty() { all_assets() } else { requested };

            let mut map = serde_json::Map::new();
            for asset in assets {
                let mut entry = serde_json::Map::new();
                for quote in &quotes {
                    let rate = QUOTE_RATES.get(quote.as_str()).copied().unwrap_or(1.0);
                    entry.insert(quote.clone(), json!(asset.price * rate));
                    entry.insert(format!("{}_24h_change", quote), json!(0.0));
                }
                entry.insert("last_updated_at".to_string(), json!(now.timestamp()));
                map.insert(asset.key, Value::Object(entry));
            }
            Value::Object(map)
        }
        EndpointCategory::Candles => {
            // [timestamp_ms, open, high, low, close], hourly, oldest first
            let end = now.timestamp_millis();
            let candles: Vec<Value> = (0..24i64)
                .rev()
                .map(|i| {
                    let p = primary.price;
                    json!([end - i * 3_600_000, p, p * 1.002, p * 0.998, p])
                })
                .collect();
            Value::Array(candles)
        }
        EndpointCategory::OrderBook => {
            let p = primary.price;
            let level = |side: f64, i: u32| json!([p * (1.0 + side * 0.0005 * i as f64), i as f64]);
            json!({
                "symbol": primary.symbol,
                "bids": (1..=5).map(|i| level(-1.0, i)).collect::<Vec<_>>(),
                "asks": (1..=5).map(|i| level(1.0, i)).collect::<Vec<_>>(),
                "timestamp": now.timestamp_millis(),
            })
        }
        EndpointCategory::AccountBalance => json!({
            "balances": [
                { "asset": "USDC", "free": 0.0, "locked": 0.0 }
            ],
            "total_usd": 0.0,
            "updated_at": now.to_rfc3339(),
        }),
        EndpointCategory::RecentTrades => {
            let trades: Vec<Value> = (0..5i64)
                .map(|i| {
                    json!({
                        "price": primary.price,
                        "quantity": 0.01,
                        "side": if i % 2 == 0 { "buy" } else { "sell" },
                        "timestamp": now.timestamp_millis() - i * 1_000,
                    })
                })
                .collect();
            json!({ "symbol": primary.symbol, "trades": trades })
        }
        EndpointCategory::MarketSummary => {
            let assets = if requested.is_empty() { all_assets() } else { requested };
            let markets: Vec<Value> = assets
                .iter()
                .map(|a| {
                    json!({
                        "symbol": a.symbol,
                        "price": a.price,
                        "change_24h_pct": 0.0,
                        "volume_24h": 0.0,
                    })
                })
                .collect();
            json!({ "markets": markets, "timestamp": now.to_rfc3339() })
        }
        EndpointCategory::Unknown => return None,
    };

    Some(value)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(*n))
}

/// Lowercased path and decoded query pairs
fn parse(endpoint: &str) -> (String, Vec<(String, String)>) {
    let url = Url::parse(endpoint)
        .or_else(|_| Url::parse("http://upstream.local/").and_then(|base| base.join(endpoint)));

    match url {
        Ok(url) => (
            url.path().to_lowercase(),
            url.query_pairs()
                .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
                .collect(),
        ),
        Err(_) => (endpoint.to_lowercase(), Vec::new()),
    }
}

fn requested_assets(path: &str, params: &[(String, String)]) -> Vec<Requested> {
    let mut out: Vec<Requested> = Vec::new();

    for (key, value) in params {
        if !SYMBOL_PARAMS.contains(&key.as_str()) {
            continue;
        }
        for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(asset) = resolve(raw) {
                if !out.iter().any(|a| a.key == asset.key) {
                    out.push(asset);
                }
            }
        }
    }

    // e.g. /coins/bitcoin/ohlc or /ticker/BTCUSDT
    if out.is_empty() {
        if let Some(asset) = path.split('/').find_map(resolve) {
            out.push(asset);
        }
    }
    out
}

fn resolve(raw: &str) -> Option<Requested> {
    let symbol = resolve_symbol(raw)?;
    let price = *SEED_PRICES.get(symbol)?;
    Some(Requested {
        key: raw.to_string(),
        symbol,
        price,
    })
}

fn resolve_symbol(raw: &str) -> Option<&'static str> {
    if let Some(symbol) = COIN_IDS.get(raw.to_lowercase().as_str()) {
        return Some(*symbol);
    }

    let upper = raw.to_uppercase();
    let base = upper
        .split(|c| c == '/' || c == '-' || c == '_')
        .next()
        .unwrap_or(&upper);
    if let Some((key, _)) = SEED_PRICES.get_entry(base) {
        return Some(*key);
    }

    QUOTE_SUFFIXES.iter().find_map(|suffix| {
        let stripped = base.strip_suffix(suffix).filter(|s| !s.is_empty())?;
        SEED_PRICES.get_entry(stripped).map(|(key, _)| *key)
    })
}

fn quote_currencies(params: &[(String, String)]) -> Vec<String> {
    let quotes: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "vs_currencies" || k == "vs_currency" || k == "quote")
        .flat_map(|(_, v)| v.split(',').map(|s| s.trim().to_lowercase()).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .collect();

    if quotes.is_empty() {
        vec!["usd".to_string()]
    } else {
        quotes
    }
}

fn default_asset() -> Requested {
    Requested {
        key: DEFAULT_SYMBOL.to_string(),
        symbol: DEFAULT_SYMBOL,
        price: SEED_PRICES.get(DEFAULT_SYMBOL).copied().unwrap_or(0.0),
    }
}

fn all_assets() -> Vec<Requested> {
    let mut assets: Vec<Requested> = SEED_PRICES
        .entries()
        .map(|(symbol, price)| Requested {
            key: symbol.to_string(),
            symbol: *symbol,
            price: *price,
        })
        .collect();
    assets.sort_by(|a, b| a.symbol.cmp(b.symbol));
    assets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_detection() {
        use EndpointCategory::*;
        let cases = [
            ("/simple/price?ids=bitcoin&vs_currencies=usd", PriceQuote),
            ("https://api.exchange.test/api/v3/ticker/price?symbol=BTCUSDT", PriceQuote),
            ("/coins/bitcoin/ohlc?vs_currency=usd&days=1", Candles),
            ("/api/v3/klines?symbol=ETHUSDT&interval=1h", Candles),
            ("/api/v3/depth?symbol=BTCUSDT", OrderBook),
            ("/v2/accounts/balance", AccountBalance),
            ("/api/v3/trades?symbol=SOLUSDT", RecentTrades),
            ("/api/market/summary", MarketSummary),
            ("/api/v3/ticker/24hr", PriceQuote),
            ("/api/research/metrics", Unknown),
        ];
        for (endpoint, expected) in cases {
            assert_eq!(EndpointCategory::from_endpoint(endpoint), expected, "{}", endpoint);
        }
    }

    #[test]
    fn test_price_quote_keyed_like_request() {
        let data = synthetic_payload(
            EndpointCategory::PriceQuote,
            "/simple/price?ids=bitcoin,ethereum&vs_currencies=usd,eur",
        )
        .unwrap();

        assert_eq!(data["bitcoin"]["usd"], 43250.0);
        assert!((data["ethereum"]["eur"].as_f64().unwrap() - 2280.0 * 0.92).abs() < 1e-6);
        assert!(data["bitcoin"]["last_updated_at"].is_i64());
    }

    #[test]
    fn test_price_quote_without_symbols_lists_all_seeds() {
        let data = synthetic_payload(EndpointCategory::PriceQuote, "/api/prices").unwrap();
        let map = data.as_object().unwrap();
        assert_eq!(map.len(), SEED_PRICES.len());
        assert_eq!(data["SOL"]["usd"], 98.5);
    }

    #[test]
    fn test_pair_symbols_resolve() {
        assert_eq!(resolve_symbol("BTCUSDT"), Some("BTC"));
        assert_eq!(resolve_symbol("eth-usd"), Some("ETH"));
        assert_eq!(resolve_symbol("SOL/USDC"), Some("SOL"));
        assert_eq!(resolve_symbol("matic-network"), Some("MATIC"));
        assert_eq!(resolve_symbol("NOPE"), None);
    }

    #[test]
    fn test_candles_use_path_symbol() {
        let data = synthetic_payload(EndpointCategory::Candles, "/coins/ethereum/ohlc?days=1").unwrap();
        let candles = data.as_array().unwrap();
        assert_eq!(candles.len(), 24);
        assert_eq!(candles[0][4], 2280.0);
        assert!(candles[0][0].as_i64() < candles[23][0].as_i64());
    }

    #[test]
    fn test_order_book_sides_straddle_price() {
        let data = synthetic_payload(EndpointCategory::OrderBook, "/depth?symbol=BTCUSDT").unwrap();
        let best_bid = data["bids"][0][0].as_f64().unwrap();
        let best_ask = data["asks"][0][0].as_f64().unwrap();
        assert!(best_bid < 43250.0 && best_ask > 43250.0);
        assert_eq!(data["symbol"], "BTC");
    }

    #[test]
    fn test_unknown_category_has_no_shape() {
        assert!(synthetic_payload(EndpointCategory::Unknown, "/whatever").is_none());
    }
}
