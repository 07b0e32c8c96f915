//! Prompt assembly for rule execution.
//!
//! A rule's prompt template (or the built-in default) is expanded with
//! `{{placeholder}}` markers from the review context. Unknown markers are
//! left in place so a typo is visible in the persisted prompt instead of
//! silently vanishing.

use verust_db::models::Review;

use crate::rules::RuleConfig;

/// Template used when a rule has no prompt of its own.
const DEFAULT_TEMPLATE: &str = "You are reviewing a code change in {{repo_url}} ({{git_ref}}).\n\
\n\
Pull request: {{pr_title}}\n\
{{pr_description}}\n\
\n\
Changed files:\n\
{{changed_files}}\n\
\n\
Diff:\n\
```diff\n\
{{diff}}\n\
```\n\
\n\
Rule: {{rule_id}}. {{rule_description}}\n\
Report findings as a fenced ```json block with a top-level \"findings\" \
array; each finding has category, severity, file, line_start, line_end, \
message and an optional suggestion. Respond in {{output_language}}.";

/// Everything a prompt can reference.
#[derive(Debug)]
pub struct PromptContext<'a> {
    pub review: &'a Review,
    pub rule: &'a RuleConfig,
    pub diff: &'a str,
    pub changed_files: &'a [String],
    pub output_language: &'a str,
}

/// Expand the rule's template with the review context.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let template = ctx.rule.prompt.as_deref().unwrap_or(DEFAULT_TEMPLATE);

    let changed_files = if ctx.changed_files.is_empty() {
        "(not available)".to_string()
    } else {
        ctx.changed_files.join("\n")
    };

    let substitutions: &[(&str, &str)] = &[
        ("{{repo_url}}", &ctx.review.repo_url),
        ("{{git_ref}}", &ctx.review.git_ref),
        ("{{commit_sha}}", &ctx.review.commit_sha),
        ("{{pr_title}}", ctx.review.pr_title.as_deref().unwrap_or("")),
        (
            "{{pr_description}}",
            ctx.review.pr_description.as_deref().unwrap_or(""),
        ),
        ("{{author}}", ctx.review.author.as_deref().unwrap_or("")),
        ("{{changed_files}}", &changed_files),
        ("{{diff}}", ctx.diff),
        ("{{rule_id}}", &ctx.rule.id),
        (
            "{{rule_description}}",
            ctx.rule.description.as_deref().unwrap_or(""),
        ),
        ("{{output_language}}", ctx.output_language),
    ];

    let mut prompt = template.to_string();
    for (marker, value) in substitutions {
        if prompt.contains(marker) {
            prompt = prompt.replace(marker, value);
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MultiRunConfig;
    use chrono::Utc;
    use sqlx::types::Json;
    use uuid::Uuid;
    use verust_db::models::ReviewStatus;

    fn review() -> Review {
        Review {
            id: Uuid::now_v7(),
            repo_url: "https://example.com/a/b".into(),
            git_ref: "main".into(),
            commit_sha: "abc".into(),
            pr_number: None,
            pr_url: None,
            base_commit_sha: None,
            pr_title: Some("Add widget".into()),
            pr_description: Some("Adds the widget.".into()),
            changed_files: Json(vec![]),
            author: Some("alice".into()),
            source: "webhook".into(),
            triggered_by: None,
            status: ReviewStatus::Running,
            retry_count: 0,
            current_rule_index: 0,
            error_message: None,
            lines_added: 0,
            lines_deleted: 0,
            files_changed: 0,
            commit_count: 0,
            branch_created_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    fn rule(prompt: Option<&str>) -> RuleConfig {
        RuleConfig {
            id: "style".into(),
            description: Some("check style".into()),
            prompt: prompt.map(str::to_string),
            agents: vec![],
            multi_run: MultiRunConfig::default(),
            enabled: true,
        }
    }

    #[test]
    fn custom_template_substitution() {
        let review = review();
        let rule = rule(Some("Rule {{rule_id}} on {{repo_url}}: {{diff}} [{{output_language}}]"));
        let files = vec!["src/lib.rs".to_string()];
        let prompt = build_prompt(&PromptContext {
            review: &review,
            rule: &rule,
            diff: "+added line",
            changed_files: &files,
            output_language: "en",
        });
        assert_eq!(
            prompt,
            "Rule style on https://example.com/a/b: +added line [en]"
        );
    }

    #[test]
    fn default_template_mentions_everything() {
        let review = review();
        let rule = rule(None);
        let files = vec!["src/lib.rs".to_string(), "src/main.rs".to_string()];
        let prompt = build_prompt(&PromptContext {
            review: &review,
            rule: &rule,
            diff: "+x",
            changed_files: &files,
            output_language: "de",
        });
        assert!(prompt.contains("https://example.com/a/b"));
        assert!(prompt.contains("Add widget"));
        assert!(prompt.contains("src/lib.rs\nsrc/main.rs"));
        assert!(prompt.contains("+x"));
        assert!(prompt.contains("Respond in de."));
        assert!(!prompt.contains("{{"), "all markers must be expanded");
    }

    #[test]
    fn empty_changed_files_get_placeholder_text() {
        let review = review();
        let rule = rule(Some("files: {{changed_files}}"));
        let prompt = build_prompt(&PromptContext {
            review: &review,
            rule: &rule,
            diff: "",
            changed_files: &[],
            output_language: "en",
        });
        assert_eq!(prompt, "files: (not available)");
    }

    #[test]
    fn unknown_markers_survive() {
        let review = review();
        let rule = rule(Some("{{mystery}}"));
        let prompt = build_prompt(&PromptContext {
            review: &review,
            rule: &rule,
            diff: "",
            changed_files: &[],
            output_language: "en",
        });
        assert_eq!(prompt, "{{mystery}}");
    }
}
