//! File name derivation for downloaded artifacts.
//!
//! Names are deterministic: the same URL, template, post and index always
//! produce the same file name, which is what makes existence checks across
//! runs meaningful.

use std::path::{Component, Path};

use chrono::DateTime;

/// Template that keeps the remote file name as-is.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%f";

/// Post facts available to filename templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilenameContext<'a> {
    /// Blog name (`%b`).
    pub blog: &'a str,
    /// Post id (`%i`).
    pub post_id: &'a str,
    /// Post timestamp in unix seconds (`%d`, `%e`).
    pub timestamp: i64,
    /// Post slug (`%s`).
    pub slug: &'a str,
    /// Post tags (`%t`).
    pub tags: &'a [String],
    /// Blog the post was reblogged from (`%r`).
    pub reblogged_from: &'a str,
}

/// Last path segment of `url`, without query or fragment.
///
/// ```
/// use blogcrawl_core::download::url_file_name;
///
/// assert_eq!(url_file_name("https://h/a/tumblr_x_1280.jpg?x=1#y"), "tumblr_x_1280.jpg");
/// ```
#[must_use]
pub fn url_file_name(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Returns true when `template` is the pass-through `%f` template.
#[must_use]
pub fn is_default_template(template: &str) -> bool {
    template.eq_ignore_ascii_case(DEFAULT_FILENAME_TEMPLATE)
}

/// Builds the on-disk file name for a media URL.
///
/// With the `%f` template the remote name is kept (`.gifv` becomes `.gif`).
/// Any other template substitutes post facts, inserts `index` at `%x` (or
/// appends `_{index}` when `%x` is absent), and appends the URL's extension.
#[must_use]
pub fn build_file_name(
    template: &str,
    url: &str,
    ctx: &FilenameContext<'_>,
    index: Option<u32>,
) -> String {
    let remote = url_file_name(url);
    let remote = normalize_remote_name(&remote);

    if template.trim().is_empty() || is_default_template(template) {
        return sanitize_filename(&remote);
    }

    let (stem, extension) = split_extension(&remote);
    let tags = ctx.tags.join(",");

    let mut name = template
        .replace("%b", ctx.blog)
        .replace("%i", ctx.post_id)
        .replace("%d", &format_timestamp(ctx.timestamp, "%Y%m%d"))
        .replace("%e", &format_timestamp(ctx.timestamp, "%Y%m%d%H%M%S"))
        .replace("%s", ctx.slug)
        .replace("%t", &tags)
        .replace("%r", ctx.reblogged_from)
        .replace("%f", stem);

    match index {
        Some(i) if name.contains("%x") => name = name.replace("%x", &i.to_string()),
        Some(i) => name.push_str(&format!("_{i}")),
        None => name = name.replace("%x", ""),
    }

    name.push_str(extension);
    sanitize_filename(&name)
}

fn normalize_remote_name(name: &str) -> String {
    if let Some(stem) = name.strip_suffix(".gifv") {
        return format!("{stem}.gif");
    }
    if name.ends_with(".pnj") {
        return format!("{name}.png");
    }
    name.to_string()
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => (&name[..pos], &name[pos..]),
    }
}

fn format_timestamp(timestamp: i64, pattern: &str) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format(pattern).to_string())
        .unwrap_or_default()
}

/// Replaces characters that are invalid on common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
