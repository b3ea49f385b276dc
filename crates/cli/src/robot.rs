//! Synthetic two-level crawl: categories, then pages until an empty one.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{context, ScopeParam};
use harvester_execution::{find_page_count, DataFeature, Parallel, Step};
use serde::Serialize;
use tracing::debug;

/// Products found on every page.
const PRODUCTS_PER_PAGE: usize = 3;

/// Shape of the simulated site.
#[derive(Debug, Clone)]
pub struct CrawlPlan {
    /// Number of categories, crawled concurrently
    pub categories: usize,
    /// Pages per category
    pub pages: i64,
    /// Simulated fetch latency
    pub delay: Duration,
    /// Page that fails, as `category-N/PAGE`
    pub fail_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct Product {
    category: String,
    page: i64,
    title: String,
}

/// Entrypoint of a crawl run.
pub async fn crawl(plan: Arc<CrawlPlan>) -> anyhow::Result<()> {
    let categories: Vec<String> = (1..=plan.categories)
        .map(|n| format!("category-{}", n))
        .collect();

    let page = Arc::new(context::wrap_with_scope(
        "page",
        vec![ScopeParam::new(0, "category"), ScopeParam::new(1, "page")],
        move |(category, page): (String, i64)| {
            let plan = plan.clone();
            async move { fetch_page(&plan, &category, page).await }
        },
    ));

    let category = context::wrap_with_scope(
        "category",
        vec![ScopeParam::new(0, "name")],
        move |(name,): (String,)| {
            let page = page.clone();
            async move {
                Parallel::current()?
                    .count_while(1, |number| {
                        let page = page.clone();
                        let name = name.clone();
                        async move { page.call((name, number)).await }
                    })
                    .await
            }
        },
    );

    Parallel::current()?
        .for_each(categories, |name| category.call((name,)))
        .await
}

async fn fetch_page(plan: &CrawlPlan, category: &str, page: i64) -> anyhow::Result<Step> {
    tokio::time::sleep(plan.delay).await;
    if page > plan.pages {
        debug!("{} has no page {}", category, page);
        return Ok(Step::Stop);
    }

    let location = format!("{}/{}", category, page);
    if plan.fail_at.as_deref() == Some(location.as_str()) {
        anyhow::bail!("failed to fetch {}", location);
    }

    let scope = context::current()?;
    for n in 1..=PRODUCTS_PER_PAGE {
        let product = Product {
            category: category.to_string(),
            page,
            title: format!("{} item {}", location, n),
        };
        DataFeature::report_data(&scope, "product", &product)?;
    }

    if page == 1 {
        let pages = plan.pages;
        let last = find_page_count(|n| async move { Ok::<_, anyhow::Error>(n <= pages) }).await?;
        debug!("{} has {} pages", category, last);
        return Ok(Step::UpperBound(last + 1));
    }
    Ok(Step::Continue)
}
