//! User-defined output templates.
//!
//! A client can reshape a finished execution's [`StandardizedOutput`] through
//! a JSON template whose string leaves contain `{placeholder}` markers, paired
//! with a map of extraction rules, natural-language instructions, one per
//! placeholder. A rule is interpreted by a keyword matcher (bilingual,
//! English and Chinese): rules about summaries clip team outputs, rules about
//! key technologies scan a fixed lexicon, rules about trends, challenges,
//! recommendations, data sources, and methodology each select sentences by
//! their own keyword set. Anything else falls back to a generic extraction
//! keyed off the field name.
//!
//! Processing is pure and deterministic: parse the template, validate the
//! rules, extract per-rule values (failures become `[Failed to extract ...]`
//! placeholders rather than aborting the whole format), then substitute into
//! the template. Lists render joined with `", "`; unresolved names render as
//! `[Missing: name]`, bad dotted paths as `[Invalid path: name]`.
//!
//! # Example
//!
//! ```rust,no_run
//! use teamllm::template::TemplateProcessor;
//! use serde_json::json;
//! # let results: teamllm::model::StandardizedOutput = unimplemented!();
//!
//! let template = json!({"title": "Report", "body": "{summary}"});
//! let rules = json!({"summary": "Summarize all team findings, limit 200 chars"});
//!
//! let processor = TemplateProcessor::new();
//! let formatted = processor.process(&template, &rules, &results).unwrap();
//! ```

use crate::teamllm::model::StandardizedOutput;
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

lazy_static! {
    /// Technology lexicon scanned by key-technology rules.
    static ref TECH_KEYWORDS: Vec<&'static str> = vec![
        "深度学习", "机器学习", "人工智能", "自然语言处理", "计算机视觉",
        "deep learning", "machine learning", "artificial intelligence",
        "natural language processing", "computer vision", "neural network",
        "医学影像", "病历分析", "药物发现", "预测分析",
    ];

    /// Sentence indicators for trend rules.
    static ref TREND_INDICATORS: Vec<&'static str> = vec![
        "增长", "趋势", "发展", "预计", "预测",
        "growth", "trend", "forecast", "expected", "市场", "应用",
    ];

    /// Sentence indicators for challenge rules.
    static ref CHALLENGE_KEYWORDS: Vec<&'static str> = vec![
        "挑战", "问题", "困难", "障碍",
        "challenge", "problem", "issue", "difficulty", "隐私", "可解释性",
    ];

    /// Sentence indicators for recommendation rules.
    static ref RECOMMENDATION_KEYWORDS: Vec<&'static str> = vec![
        "建议", "推荐", "应该", "需要",
        "recommend", "suggest", "should", "need to", "推进", "加强",
    ];

    /// Line prefixes that mark a data source.
    static ref SOURCE_MARKERS: Vec<&'static str> = vec![
        "来源", "source", "参考", "reference", "数据库", "database",
    ];

    /// Sentence indicators for methodology rules.
    static ref METHOD_KEYWORDS: Vec<&'static str> =
        vec!["方法", "methodology", "approach", "method", "process"];
}

/// Errors raised while processing a template request.
#[derive(Debug, Clone)]
pub enum TemplateError {
    /// The template was not a non-empty JSON object.
    InvalidTemplate(String),
    /// The extraction rules were not a non-empty map of non-empty strings.
    InvalidRules(String),
    /// Extraction failed wholesale (per-field failures are tolerated and
    /// rendered inline instead).
    Extraction(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::InvalidTemplate(msg) => write!(f, "Template parsing failed: {}", msg),
            TemplateError::InvalidRules(msg) => write!(f, "Rule validation failed: {}", msg),
            TemplateError::Extraction(msg) => write!(f, "Information extraction failed: {}", msg),
        }
    }
}

impl Error for TemplateError {}

/// Parses templates, interprets extraction rules, and substitutes values.
///
/// Stateless and cheap to construct.
#[derive(Debug, Default)]
pub struct TemplateProcessor;

impl TemplateProcessor {
    /// Create a processor.
    pub fn new() -> Self {
        TemplateProcessor
    }

    /// Validate a template: the root must be a non-empty JSON object. The
    /// returned clone is the validated template.
    pub fn parse_template(&self, template: &Value) -> Result<Value, TemplateError> {
        let object = template
            .as_object()
            .ok_or_else(|| TemplateError::InvalidTemplate("Template must be an object".into()))?;
        if object.is_empty() {
            return Err(TemplateError::InvalidTemplate("Template cannot be empty".into()));
        }
        let placeholders = self.collect_placeholders(template);
        log::debug!(
            "Parsed template with {} top-level fields, placeholders {:?}",
            object.len(),
            placeholders
        );
        Ok(template.clone())
    }

    /// Every `{placeholder}` name found in the template's string leaves, in
    /// depth-first order, duplicates preserved.
    pub fn collect_placeholders(&self, template: &Value) -> Vec<String> {
        let mut found = Vec::new();
        collect_placeholders_into(template, &mut found);
        found
    }

    /// Validate extraction rules: a non-empty map of non-empty field names to
    /// non-empty rule strings. Names and rules come back trimmed. Extra
    /// rules with no matching placeholder are allowed.
    pub fn validate_extraction_rules(
        &self,
        rules: &Value,
    ) -> Result<HashMap<String, String>, TemplateError> {
        let object = rules.as_object().ok_or_else(|| {
            TemplateError::InvalidRules("Extraction rules must be an object".into())
        })?;
        if object.is_empty() {
            return Err(TemplateError::InvalidRules(
                "Extraction rules cannot be empty".into(),
            ));
        }
        let mut validated = HashMap::new();
        for (field_name, rule) in object {
            if field_name.trim().is_empty() {
                return Err(TemplateError::InvalidRules(format!(
                    "Invalid field name: '{}'",
                    field_name
                )));
            }
            let rule = rule.as_str().map(str::trim).unwrap_or("");
            if rule.is_empty() {
                return Err(TemplateError::InvalidRules(format!(
                    "Invalid rule for field {}",
                    field_name
                )));
            }
            validated.insert(field_name.trim().to_string(), rule.to_string());
        }
        Ok(validated)
    }

    /// Apply every rule against the results. Per-field failures do not abort
    /// the extraction; the field's value becomes a
    /// `[Failed to extract <name>: <reason>]` marker instead.
    pub fn extract_information(
        &self,
        rules: &HashMap<String, String>,
        results: &StandardizedOutput,
    ) -> HashMap<String, Value> {
        let mut extracted = HashMap::new();
        for (field_name, rule) in rules {
            let value = match self.apply_rule(rule, results, field_name) {
                Ok(value) => value,
                Err(reason) => {
                    log::warn!("Failed to extract {}: {}", field_name, reason);
                    Value::String(format!("[Failed to extract {}: {}]", field_name, reason))
                }
            };
            extracted.insert(field_name.clone(), value);
        }
        extracted
    }

    /// Substitute extracted values into the template. Non-string leaves pass
    /// through verbatim.
    pub fn format_output(&self, template: &Value, extracted: &HashMap<String, Value>) -> Value {
        match template {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), self.format_output(value, extracted)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.format_output(item, extracted))
                    .collect(),
            ),
            Value::String(text) => Value::String(substitute_placeholders(text, extracted)),
            other => other.clone(),
        }
    }

    /// The full pipeline: parse, validate, extract, substitute.
    pub fn process(
        &self,
        template: &Value,
        rules: &Value,
        results: &StandardizedOutput,
    ) -> Result<Value, TemplateError> {
        let template = self.parse_template(template)?;
        let rules = self.validate_extraction_rules(rules)?;
        let extracted = self.extract_information(&rules, results);
        Ok(self.format_output(&template, &extracted))
    }

    /// Route a rule to its matcher by keyword. Order matters: summary first,
    /// then technologies (unless the rule is about challenges), trends,
    /// challenges, recommendations, sources, methodology, generic fallback.
    fn apply_rule(
        &self,
        rule: &str,
        results: &StandardizedOutput,
        field_name: &str,
    ) -> Result<Value, String> {
        let rule_lower = rule.to_lowercase();

        if rule_lower.contains("executive summary")
            || rule_lower.contains("summary")
            || rule_lower.contains("摘要")
        {
            Ok(Value::String(self.extract_summary(results, rule)))
        } else if rule_lower.contains("关键技术")
            || ((rule_lower.contains("key technologies") || rule_lower.contains("technologies"))
                && !rule_lower.contains("挑战"))
        {
            Ok(string_list(self.extract_technologies(results, rule)))
        } else if rule_lower.contains("市场趋势")
            || rule_lower.contains("趋势")
            || rule_lower.contains("market trends")
            || rule_lower.contains("trends")
        {
            Ok(string_list(self.extract_trends(results)))
        } else if rule_lower.contains("挑战") || rule_lower.contains("challenges") {
            Ok(string_list(self.extract_challenges(results)))
        } else if rule_lower.contains("建议") || rule_lower.contains("recommendations") {
            Ok(string_list(self.extract_recommendations(results, rule)))
        } else if rule_lower.contains("数据来源")
            || rule_lower.contains("来源")
            || rule_lower.contains("data sources")
            || rule_lower.contains("sources")
        {
            Ok(string_list(self.extract_data_sources(results)))
        } else if rule_lower.contains("方法") || rule_lower.contains("methodology") {
            Ok(Value::String(self.extract_methodology(results)))
        } else {
            Ok(self.extract_generic(results, field_name))
        }
    }

    /// Concatenate a prefix of each team's output; clip to any character
    /// bound mentioned in the rule.
    fn extract_summary(&self, results: &StandardizedOutput, rule: &str) -> String {
        let mut parts = Vec::new();
        for result in results.team_results.values() {
            if let Some(output) = &result.output {
                let snippet: String = output.chars().take(200).collect();
                let snippet = snippet.trim();
                if !snippet.is_empty() {
                    parts.push(snippet.to_string());
                }
            }
        }
        if parts.is_empty() {
            return "No summary information available".to_string();
        }

        let mut combined = parts.join(" ");
        if rule.contains("不超过") || rule.to_lowercase().contains("limit") {
            if let Some(limit) = first_number(rule) {
                if combined.chars().count() > limit {
                    combined = combined.chars().take(limit).collect::<String>() + "...";
                }
            }
        }
        combined
    }

    /// Scan all outputs for the technology lexicon, collecting matches in the
    /// order they first appear in the text; honor a numeric limit from the
    /// rule.
    fn extract_technologies(&self, results: &StandardizedOutput, rule: &str) -> Vec<String> {
        let mut technologies: Vec<String> = Vec::new();
        for output in all_outputs(results) {
            let output_lower = output.to_lowercase();
            let mut matches: Vec<(usize, &str)> = TECH_KEYWORDS
                .iter()
                .filter_map(|keyword| {
                    output_lower
                        .find(&keyword.to_lowercase())
                        .map(|pos| (pos, *keyword))
                })
                .collect();
            matches.sort_by_key(|(pos, _)| *pos);
            for (_, keyword) in matches {
                if !technologies.iter().any(|t| t == keyword) {
                    technologies.push(keyword.to_string());
                }
            }
        }
        if let Some(limit) = first_number(rule) {
            technologies.truncate(limit);
        }
        if technologies.is_empty() {
            technologies = vec![
                "深度学习".to_string(),
                "自然语言处理".to_string(),
                "机器学习".to_string(),
            ];
        }
        technologies
    }

    fn extract_trends(&self, results: &StandardizedOutput) -> Vec<String> {
        let mut trends = select_sentences(results, &TREND_INDICATORS);
        trends.truncate(5);
        if trends.is_empty() {
            trends = vec![
                "AI医疗市场快速增长".to_string(),
                "个性化医疗成为发展重点".to_string(),
                "医学影像AI应用增长迅速".to_string(),
            ];
        }
        trends
    }

    fn extract_challenges(&self, results: &StandardizedOutput) -> Vec<String> {
        let mut challenges = select_sentences(results, &CHALLENGE_KEYWORDS);
        challenges.truncate(5);
        if challenges.is_empty() {
            challenges = vec![
                "数据隐私保护".to_string(),
                "算法可解释性".to_string(),
                "监管合规".to_string(),
                "数据质量标准化".to_string(),
            ];
        }
        challenges
    }

    fn extract_recommendations(&self, results: &StandardizedOutput, rule: &str) -> Vec<String> {
        let mut recommendations = select_sentences(results, &RECOMMENDATION_KEYWORDS);
        if let Some(limit) = first_number(rule) {
            recommendations.truncate(limit);
        }
        if recommendations.is_empty() {
            recommendations = vec![
                "建立统一的医疗AI数据标准".to_string(),
                "加强跨学科人才培养".to_string(),
                "完善AI医疗监管框架".to_string(),
            ];
        }
        recommendations
    }

    /// Lines shaped like `来源: ...` / `source: ...` yield their remainder,
    /// deduplicated.
    fn extract_data_sources(&self, results: &StandardizedOutput) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for result in results.team_results.values() {
            let output = match &result.output {
                Some(output) => output,
                None => continue,
            };
            for line in output.lines() {
                // ASCII lowercasing keeps byte offsets aligned with `line`.
                let ascii_lower = line.to_ascii_lowercase();
                for marker in SOURCE_MARKERS.iter() {
                    let found = if marker.is_ascii() {
                        ascii_lower.find(marker)
                    } else {
                        line.find(marker)
                    };
                    if let Some(pos) = found {
                        let after = &line[pos + marker.len()..];
                        // Only marker-colon lines count ("Source: x", "来源：y").
                        if !(after.starts_with(':') || after.starts_with('：')) {
                            continue;
                        }
                        let value = after
                            .trim_start_matches(|c: char| c == ':' || c == '：')
                            .trim();
                        if !value.is_empty() && !sources.iter().any(|s| s == value) {
                            sources.push(value.to_string());
                        }
                        break;
                    }
                }
            }
        }
        if sources.is_empty() {
            sources = vec![
                "Academic databases".to_string(),
                "Research publications".to_string(),
                "Industry reports".to_string(),
            ];
        }
        sources
    }

    fn extract_methodology(&self, results: &StandardizedOutput) -> String {
        let sentences = select_sentences(results, &METHOD_KEYWORDS);
        if sentences.is_empty() {
            return "Multi-agent collaborative analysis approach".to_string();
        }
        sentences
            .into_iter()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Fallback for rules no matcher claims: derive something sensible from
    /// the field name and the summary.
    fn extract_generic(&self, results: &StandardizedOutput, field_name: &str) -> Value {
        let field_lower = field_name.to_lowercase();
        if field_lower.contains("count") || field_lower.contains("number") {
            return Value::from(results.team_results.len() as u64);
        }
        if field_lower.contains("status") {
            return Value::String(results.execution_summary.status.clone());
        }
        if field_lower.contains("duration") || field_lower.contains("time") {
            return results
                .execution_summary
                .total_duration
                .map(Value::from)
                .unwrap_or(Value::Null);
        }
        for result in results.team_results.values() {
            if let Some(output) = &result.output {
                let truncated: String = output.chars().take(100).collect();
                return Value::String(if output.chars().count() > 100 {
                    truncated + "..."
                } else {
                    truncated
                });
            }
        }
        Value::String(format!("Information for {} not available", field_name))
    }
}

fn collect_placeholders_into(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for nested in map.values() {
                collect_placeholders_into(nested, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders_into(item, found);
            }
        }
        Value::String(text) => {
            for name in placeholder_names(text) {
                found.push(name);
            }
        }
        _ => {}
    }
}

/// Scan a string for `{name}` markers, returning the trimmed names.
fn placeholder_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() {
                    names.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Replace every `{name}` / `{a.b.c}` marker in `text` with the rendered
/// extracted value.
fn substitute_placeholders(text: &str, extracted: &HashMap<String, Value>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                output.push_str(&rest[..start]);
                let name = after[..end].trim();
                output.push_str(&resolve_placeholder(name, extracted));
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    output.push_str(rest);
    output
}

fn resolve_placeholder(name: &str, extracted: &HashMap<String, Value>) -> String {
    if name.is_empty() {
        return "{}".to_string();
    }
    if name.contains('.') {
        // A lookup miss yields the Missing marker only at the final segment;
        // a miss with segments still to walk (including a missing head) is an
        // Invalid path, since the marker itself is not traversable.
        let parts: Vec<&str> = name.split('.').collect();
        let mut current: Option<&Value> = None;
        for (index, part) in parts.iter().enumerate() {
            let is_last = index + 1 == parts.len();
            let next = if index == 0 {
                extracted.get(*part)
            } else {
                match current {
                    Some(Value::Object(map)) => map.get(*part),
                    _ => return format!("[Invalid path: {}]", name),
                }
            };
            match next {
                Some(value) => current = Some(value),
                None if is_last => return format!("[Missing: {}]", name),
                None => return format!("[Invalid path: {}]", name),
            }
        }
        match current {
            Some(value) => render_value(value),
            // Catch-all for a traversal that produced no value.
            None => format!("[Error accessing: {}]", name),
        }
    } else {
        match extracted.get(name) {
            Some(value) => render_value(value),
            None => format!("[Missing: {}]", name),
        }
    }
}

/// Stringify an extracted value: lists join with `", "`, strings render raw,
/// everything else via its JSON representation.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn string_list(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

/// First run of ASCII digits in `text`, as a number.
fn first_number(text: &str) -> Option<usize> {
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

/// Team outputs followed by per-worker outputs, in map order.
fn all_outputs(results: &StandardizedOutput) -> Vec<&str> {
    let mut outputs = Vec::new();
    for result in results.team_results.values() {
        if let Some(output) = &result.output {
            outputs.push(output.as_str());
        }
        if let Some(workers) = &result.workers {
            for worker in workers.values() {
                if let Some(output) = &worker.output {
                    outputs.push(output.as_str());
                }
            }
        }
    }
    outputs
}

/// Sentences (split on `。`) from every output that contain any of the
/// keywords, longer than 10 characters, deduplicated in discovery order.
fn select_sentences(results: &StandardizedOutput, keywords: &[&str]) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for output in all_outputs(results) {
        for sentence in output.split('。') {
            let sentence_lower = sentence.to_lowercase();
            if keywords.iter().any(|keyword| sentence_lower.contains(&keyword.to_lowercase())) {
                let clean = sentence.trim();
                if clean.chars().count() > 10 && !selected.iter().any(|s| s == clean) {
                    selected.push(clean.to_string());
                }
            }
        }
    }
    selected
}
