use crate::domain::records::{BackfillKind, Tenant};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_VERSION: &str = "2024-10";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("GraphQL errors: {0}")]
    GraphQl(String),
    #[error("Malformed upstream response: {0}")]
    Malformed(String),
}

/// One page of upstream nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[async_trait]
pub trait UpstreamPager: Send + Sync {
    async fn fetch_page(
        &self,
        tenant: &Tenant,
        kind: BackfillKind,
        cursor: Option<String>,
    ) -> Result<Page, UpstreamError>;
}

pub type PageStream = BoxStream<'static, Result<Page, UpstreamError>>;

enum Cursor {
    At(Option<String>),
    Exhausted,
}

/// Lazily walks pages starting at `start_cursor`. The stream ends after the
/// last page, or right after yielding the first error.
pub fn page_stream(
    pager: Arc<dyn UpstreamPager>,
    tenant: Tenant,
    kind: BackfillKind,
    start_cursor: Option<String>,
) -> PageStream {
    stream::unfold(Cursor::At(start_cursor), move |state| {
        let pager = pager.clone();
        let tenant = tenant.clone();
        async move {
            let Cursor::At(cursor) = state else {
                return None;
            };
            match pager.fetch_page(&tenant, kind, cursor).await {
                Ok(page) => {
                    let next = match (&page.next_cursor, page.has_more) {
                        (Some(next), true) => Cursor::At(Some(next.clone())),
                        _ => Cursor::Exhausted,
                    };
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), Cursor::Exhausted)),
            }
        }
    })
    .boxed()
}

const PRODUCTS_QUERY: &str = r#"
query InventoryQuery($cursor: String, $limit: Int!) {
  products(first: $limit, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    edges {
      node {
        id
        title
        variants(first: 100) {
          edges {
            node {
              id
              title
              sku
              barcode
              inventoryItem {
                id
                tracked
                inventoryLevels(first: 50) {
                  edges {
                    node {
                      id
                      quantities(names: ["available", "on_hand"]) { name quantity }
                      location { id name }
                    }
                  }
                }
              }
            }
          }
        }
      }
    }
  }
}
"#;

const ORDERS_QUERY: &str = r#"
query OrdersQuery($cursor: String, $limit: Int!) {
  orders(first: $limit, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    edges {
      node {
        id
        name
        email
        createdAt
        totalPriceSet { shopMoney { amount currencyCode } }
        displayFinancialStatus
        displayFulfillmentStatus
        lineItems(first: 50) {
          edges {
            node {
              id
              title
              variantTitle
              sku
              quantity
              variant { id }
              originalUnitPriceSet { shopMoney { amount currencyCode } }
            }
          }
        }
        fulfillments {
          id
          status
          trackingInfo { number url company }
          createdAt
        }
      }
    }
  }
}
"#;

/// Pages through the Shopify Admin GraphQL API.
#[derive(Clone)]
pub struct ShopifyGraphqlPager {
    http: reqwest::Client,
    api_version: String,
    page_size: u32,
}

impl ShopifyGraphqlPager {
    pub fn new(api_version: impl Into<String>, page_size: u32) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_version: api_version.into(),
            page_size: page_size.max(1),
        })
    }

    fn endpoint(&self, tenant: &Tenant) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            tenant.shop_domain, self.api_version
        )
    }
}

fn connection_name(kind: BackfillKind) -> &'static str {
    match kind {
        BackfillKind::Inventory => "products",
        BackfillKind::Fulfillments => "orders",
    }
}

/// Extracts nodes and page info from a GraphQL response body.
pub fn parse_page(kind: BackfillKind, body: &Value) -> Result<Page, UpstreamError> {
    if let Some(errors) = body.get("errors") {
        return Err(UpstreamError::GraphQl(errors.to_string()));
    }

    let name = connection_name(kind);
    let connection = body
        .get("data")
        .and_then(|data| data.get(name))
        .ok_or_else(|| UpstreamError::Malformed(format!("missing data.{}", name)))?;

    let items = connection
        .get("edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| edge.get("node").cloned())
                .collect()
        })
        .unwrap_or_default();

    let page_info = connection.get("pageInfo").cloned().unwrap_or(Value::Null);
    let has_more = page_info
        .get("hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = page_info
        .get("endCursor")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

#[async_trait]
impl UpstreamPager for ShopifyGraphqlPager {
    async fn fetch_page(
        &self,
        tenant: &Tenant,
        kind: BackfillKind,
        cursor: Option<String>,
    ) -> Result<Page, UpstreamError> {
        let query = match kind {
            BackfillKind::Inventory => PRODUCTS_QUERY,
            BackfillKind::Fulfillments => ORDERS_QUERY,
        };
        debug!(
            tenant_id = %tenant.tenant_id,
            kind = %kind,
            cursor = cursor.as_deref().unwrap_or(""),
            "Fetching upstream page"
        );

        let response = self
            .http
            .post(self.endpoint(tenant))
            .header("X-Shopify-Access-Token", &tenant.access_token)
            .json(&json!({
                "query": query,
                "variables": { "cursor": cursor, "limit": self.page_size },
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        parse_page(kind, &body)
    }
}
