//! Template rendering: token substitution and Markdown → HTML.
//!
//! Image references in the Markdown body are rewritten to `cid:<name>`, with
//! the name taken from the image's alt text, so the HTML points at inline
//! attachments instead of remote URLs.

use comrak::nodes::{AstNode, NodeValue};
use comrak::{Arena, Options, format_html, parse_document};

use crate::campaign::{TOKEN_PLACEHOLDER, Template};
use crate::error::RenderError;

/// Rendered message bodies plus the inline images the HTML refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub text: String,
    pub html: String,
    /// Referenced image names, first occurrence order, without duplicates.
    pub images: Vec<String>,
}

/// Render both bodies of `template` with `token` substituted.
pub fn render(template: &Template, token: &str) -> Result<RenderedBody, RenderError> {
    let text = template.text_body.replace(TOKEN_PLACEHOLDER, token);
    let markdown = template.html_body.replace(TOKEN_PLACEHOLDER, token);
    let (html, images) = markdown_to_inline_html(&markdown, &template.id)?;

    if let Some(missing) = images.iter().find(|name| template.image(name).is_none()) {
        return Err(RenderError::UnknownImage {
            template: template.id.clone(),
            name: missing.clone(),
        });
    }

    Ok(RenderedBody { text, html, images })
}

fn markdown_to_inline_html(
    markdown: &str,
    template_id: &str,
) -> Result<(String, Vec<String>), RenderError> {
    let arena = Arena::new();
    let options = Options::default();
    let root = parse_document(&arena, markdown, &options);

    let mut images: Vec<String> = Vec::new();
    for node in root.descendants() {
        if !matches!(node.data.borrow().value, NodeValue::Image(_)) {
            continue;
        }
        let name = alt_text(node);
        if name.is_empty() {
            return Err(RenderError::UnnamedImage {
                template: template_id.to_string(),
            });
        }
        if let NodeValue::Image(ref mut link) = node.data.borrow_mut().value {
            link.url = format!("cid:{name}");
        }
        if !images.contains(&name) {
            images.push(name);
        }
    }

    let mut html = String::new();
    format_html(root, &options, &mut html).map_err(|e| RenderError::Markdown(e.to_string()))?;
    Ok((html, images))
}

/// Concatenated text content below an image node.
fn alt_text<'a>(node: &'a AstNode<'a>) -> String {
    let mut out = String::new();
    for child in node.descendants() {
        if let NodeValue::Text(ref t) = child.data.borrow().value {
            out.push_str(t);
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::TemplateImage;

    fn template(html_body: &str, images: &[&str]) -> Template {
        Template {
            id: "t1".into(),
            subject: "Subject".into(),
            sender: "team@example.com".into(),
            html_body: html_body.into(),
            text_body: "Unsubscribe: https://example.com/u/{{Token}}".into(),
            images: images
                .iter()
                .map(|n| TemplateImage {
                    name: n.to_string(),
                    url: format!("/uploads/{n}.png"),
                    width: None,
                    height: None,
                })
                .collect(),
        }
    }

    #[test]
    fn token_substituted_in_both_bodies() {
        let t = template("[Unsubscribe](https://example.com/u/{{Token}})", &[]);
        let out = render(&t, "abc123").unwrap();
        assert_eq!(out.text, "Unsubscribe: https://example.com/u/abc123");
        assert!(out.html.contains("https://example.com/u/abc123"));
        assert!(!out.html.contains("{{Token}}"));
    }

    #[test]
    fn markdown_becomes_html() {
        let out = render(&template("# Welcome\n\nHello **there**", &[]), "x").unwrap();
        assert!(out.html.contains("<h1>Welcome</h1>"));
        assert!(out.html.contains("<strong>there</strong>"));
        assert!(out.images.is_empty());
    }

    #[test]
    fn images_rewritten_to_content_ids() {
        let t = template(
            "![logo](/uploads/logo.png)\n\n![banner](https://cdn.example.com/b.png)\n\n![logo](/again.png)",
            &["logo", "banner", "unused"],
        );
        let out = render(&t, "x").unwrap();
        assert!(out.html.contains(r#"src="cid:logo""#));
        assert!(out.html.contains(r#"src="cid:banner""#));
        assert!(!out.html.contains("/uploads/logo.png"));
        assert_eq!(out.images, vec!["logo".to_string(), "banner".to_string()]);
    }

    #[test]
    fn unnamed_image_is_an_error() {
        let err = render(&template("![](/uploads/x.png)", &[]), "x").unwrap_err();
        assert!(matches!(err, RenderError::UnnamedImage { .. }));
    }

    #[test]
    fn unknown_image_is_an_error() {
        let err = render(&template("![ghost](/g.png)", &["logo"]), "x").unwrap_err();
        assert!(matches!(err, RenderError::UnknownImage { ref name, .. } if name == "ghost"));
    }
}
