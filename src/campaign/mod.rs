//! Campaign definitions: the read-only drip sequences fetched from the CMS.

pub mod cms;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CampaignError;

pub use cms::CmsCampaignSource;

/// Placeholder replaced with the unsubscribe token in both bodies.
pub const TOKEN_PLACEHOLDER: &str = "{{Token}}";

/// A message template as stored in the CMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub subject: String,
    pub sender: String,
    /// Markdown source with a token placeholder and image references.
    pub html_body: String,
    /// Plain-text body with a token placeholder.
    pub text_body: String,
    #[serde(default)]
    pub images: Vec<TemplateImage>,
}

impl Template {
    /// Look up an inline image by the name the Markdown refers to it with.
    pub fn image(&self, name: &str) -> Option<&TemplateImage> {
        self.images.iter().find(|img| img.name == name)
    }
}

/// An inline image asset, addressed relative to the CMS base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateImage {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// One stage of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Delay after the previous step completes (or after enrolment).
    pub delay_seconds: i64,
    pub template: Template,
}

impl Step {
    /// The step delay; negative values count as zero. `None` when the delay
    /// does not fit a `TimeDelta`.
    pub fn delay(&self) -> Option<TimeDelta> {
        TimeDelta::try_seconds(self.delay_seconds.max(0))
    }

    /// When this step falls due if scheduled at `from`. `None` when the
    /// result is past the representable date range.
    pub fn due_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.delay()?)
    }
}

/// A named, ordered drip sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    #[serde(rename = "stream_steps", default)]
    pub steps: Vec<Step>,
}

impl Campaign {
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// Find a step by id, along with the step that follows it (if any).
    pub fn locate(&self, step_id: &str) -> Option<(&Step, Option<&Step>)> {
        let idx = self.steps.iter().position(|s| s.id == step_id)?;
        Some((&self.steps[idx], self.steps.get(idx + 1)))
    }
}

/// Source of campaign definitions.
#[async_trait]
pub trait CampaignSource: Send + Sync {
    /// Resolve a campaign by name.
    async fn campaign(&self, name: &str) -> Result<Campaign, CampaignError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str) -> Template {
        Template {
            id: id.into(),
            subject: "Hi".into(),
            sender: "news@example.com".into(),
            html_body: "# Hi".into(),
            text_body: "Hi".into(),
            images: vec![],
        }
    }

    fn campaign() -> Campaign {
        Campaign {
            id: "1".into(),
            steps: ["a", "b", "c"]
                .iter()
                .map(|id| Step {
                    id: id.to_string(),
                    delay_seconds: 60,
                    template: template(id),
                })
                .collect(),
        }
    }

    #[test]
    fn locate_middle_step() {
        let c = campaign();
        let (curr, next) = c.locate("b").unwrap();
        assert_eq!(curr.id, "b");
        assert_eq!(next.unwrap().id, "c");
    }

    #[test]
    fn locate_last_step_has_no_next() {
        let c = campaign();
        let (curr, next) = c.locate("c").unwrap();
        assert_eq!(curr.id, "c");
        assert!(next.is_none());
    }

    #[test]
    fn locate_unknown_step() {
        assert!(campaign().locate("zzz").is_none());
    }

    #[test]
    fn negative_delay_clamped() {
        let step = Step {
            id: "x".into(),
            delay_seconds: -5,
            template: template("x"),
        };
        assert_eq!(step.delay(), Some(TimeDelta::zero()));
    }

    #[test]
    fn oversized_delay_has_no_due_time() {
        let now = Utc::now();
        let mut step = Step {
            id: "x".into(),
            delay_seconds: i64::MAX,
            template: template("x"),
        };
        assert!(step.delay().is_none());
        assert!(step.due_after(now).is_none());

        // Fits a TimeDelta but not a calendar date.
        step.delay_seconds = 400_000 * 365 * 86_400;
        assert!(step.delay().is_some());
        assert!(step.due_after(now).is_none());

        step.delay_seconds = 90;
        assert_eq!(step.due_after(now), Some(now + TimeDelta::seconds(90)));
    }

    #[test]
    fn deserializes_cms_shape() {
        let json = serde_json::json!({
            "id": "7",
            "stream_steps": [{
                "id": "s1",
                "delay_seconds": 0,
                "template": {
                    "id": "t1",
                    "subject": "Welcome",
                    "sender": "Team <team@example.com>",
                    "html_body": "![logo](/uploads/logo.png)",
                    "text_body": "Welcome",
                    "images": [{"name": "logo", "url": "/uploads/logo.png", "width": 120, "height": 40}]
                }
            }]
        });
        let c: Campaign = serde_json::from_value(json).unwrap();
        assert_eq!(c.steps.len(), 1);
        assert_eq!(c.steps[0].template.image("logo").unwrap().width, Some(120));
    }
}
