use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Registry};
use tracing_tree::HierarchicalLayer;

/// Install the global subscriber: `RUST_LOG` filtering, falling back to `info`,
/// rendered as an indented span tree
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{crate_name}=info,tower_http=debug")));

    let tree = HierarchicalLayer::default()
        .with_writer(std::io::stdout)
        .with_indent_lines(true)
        .with_indent_amount(2)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_verbose_exit(false)
        .with_verbose_entry(false)
        .with_targets(true);

    Registry::default().with(tree).with(env_filter).try_init()?;

    Ok(())
}
