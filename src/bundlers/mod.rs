// Extension-keyed bundler implementations. These are deliberately plain
// reference scanners; real language compilers plug in as processors.
pub mod css;
pub mod html;
pub mod js;

use std::sync::Arc;

use crate::core::bundler::BundlerRegistry;

/// Register the builtin bundlers for their default extensions.
pub fn register_defaults(registry: &mut BundlerRegistry) {
    registry.register("css", Arc::new(css::CssBundler));
    registry.register("html", Arc::new(html::HtmlBundler));
    registry.register("htm", Arc::new(html::HtmlBundler));
    registry.register("js", Arc::new(js::JsBundler));
    registry.register("mjs", Arc::new(js::JsBundler));
}
