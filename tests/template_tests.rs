use serde_json::json;
use std::collections::HashMap;
use teamllm::model::{
    ExecutionMetrics, ExecutionSummary, StandardizedOutput, TeamResult,
};
use teamllm::template::{TemplateError, TemplateProcessor};

fn output_with(team_outputs: &[(&str, &str)]) -> StandardizedOutput {
    let mut team_results = HashMap::new();
    for (team_id, output) in team_outputs {
        team_results.insert(
            team_id.to_string(),
            TeamResult {
                status: "completed".to_string(),
                duration: Some(30),
                workers: None,
                output: Some(output.to_string()),
            },
        );
    }
    StandardizedOutput {
        execution_id: "exec_template01".to_string(),
        execution_summary: ExecutionSummary {
            status: "completed".to_string(),
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            total_duration: Some(120),
            teams_executed: team_outputs.len() as u32,
            agents_involved: team_outputs.len() as u32,
        },
        team_results,
        errors: Vec::new(),
        metrics: ExecutionMetrics::default(),
    }
}

#[test]
fn test_parse_template_rejects_non_objects() {
    let processor = TemplateProcessor::new();
    assert!(matches!(
        processor.parse_template(&json!("just a string")),
        Err(TemplateError::InvalidTemplate(_))
    ));
    assert!(matches!(
        processor.parse_template(&json!({})),
        Err(TemplateError::InvalidTemplate(_))
    ));
    assert!(processor.parse_template(&json!({"title": "ok"})).is_ok());
}

#[test]
fn test_collect_placeholders_walks_nested_structures() {
    let processor = TemplateProcessor::new();
    let template = json!({
        "title": "Report",
        "body": "{summary}",
        "sections": [{"tech": "{tech}"}, "{summary.short}"],
        "count": 3,
    });
    let mut placeholders = processor.collect_placeholders(&template);
    placeholders.sort();
    assert_eq!(placeholders, vec!["summary", "summary.short", "tech"]);
}

#[test]
fn test_validate_rules_rejects_bad_shapes() {
    let processor = TemplateProcessor::new();
    assert!(matches!(
        processor.validate_extraction_rules(&json!([])),
        Err(TemplateError::InvalidRules(_))
    ));
    assert!(matches!(
        processor.validate_extraction_rules(&json!({})),
        Err(TemplateError::InvalidRules(_))
    ));
    assert!(matches!(
        processor.validate_extraction_rules(&json!({"field": ""})),
        Err(TemplateError::InvalidRules(_))
    ));
    assert!(matches!(
        processor.validate_extraction_rules(&json!({"field": 42})),
        Err(TemplateError::InvalidRules(_))
    ));

    let rules = processor
        .validate_extraction_rules(&json!({" field ": " extract the summary "}))
        .unwrap();
    assert_eq!(rules["field"], "extract the summary");
}

#[test]
fn test_summary_extraction_clips_to_rule_limit() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[("team_a", &"A".repeat(300))]);
    let rules = processor
        .validate_extraction_rules(&json!({"summary": "Summarize the findings, limit 50 chars"}))
        .unwrap();

    let extracted = processor.extract_information(&rules, &results);
    let summary = extracted["summary"].as_str().unwrap();
    assert!(summary.chars().count() <= 53); // 50 + "..."
    assert!(summary.ends_with("..."));
}

#[test]
fn test_technology_extraction_finds_bilingual_keywords() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[(
        "team_a",
        "The report covers deep learning methods and 机器学习 applications.",
    )]);
    let rules = processor
        .validate_extraction_rules(&json!({"tech": "extract 2 key technologies"}))
        .unwrap();

    let extracted = processor.extract_information(&rules, &results);
    let tech: Vec<&str> = extracted["tech"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    // Matches come back in the order they appear in the text.
    assert_eq!(tech, vec!["deep learning", "机器学习"]);
}

#[test]
fn test_end_to_end_template_substitution() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[(
        "team_a",
        "We studied deep learning and 机器学习 for this survey.",
    )]);

    let template = json!({"title": "R", "body": "{summary}", "list": ["{tech}"]});
    let rules = json!({
        "summary": "Summarize; limit 50 chars",
        "tech": "extract 2 key technologies"
    });

    let formatted = processor.process(&template, &rules, &results).unwrap();
    assert_eq!(formatted["title"], "R");
    let body = formatted["body"].as_str().unwrap();
    assert!(body.chars().count() <= 53);
    // List values join with ", " inside the string leaf.
    assert_eq!(formatted["list"][0], "deep learning, 机器学习");
}

#[test]
fn test_substitution_is_idempotent_without_placeholders() {
    let processor = TemplateProcessor::new();
    let template = json!({"title": "Plain", "nested": {"n": 1, "flag": true}});
    let extracted = HashMap::new();

    let once = processor.format_output(&template, &extracted);
    let twice = processor.format_output(&once, &extracted);
    assert_eq!(once, template);
    assert_eq!(twice, template);
}

#[test]
fn test_missing_and_invalid_path_markers() {
    let processor = TemplateProcessor::new();
    let mut extracted = HashMap::new();
    extracted.insert("known".to_string(), json!("value"));
    extracted.insert("flat".to_string(), json!("not an object"));

    let template = json!({
        "a": "{known}",
        "b": "{unknown}",
        "c": "{flat.deep}",
        "d": "{known} and {unknown}",
    });
    let formatted = processor.format_output(&template, &extracted);
    assert_eq!(formatted["a"], "value");
    assert_eq!(formatted["b"], "[Missing: unknown]");
    assert_eq!(formatted["c"], "[Invalid path: flat.deep]");
    assert_eq!(formatted["d"], "value and [Missing: unknown]");
}

#[test]
fn test_missing_head_with_remaining_segments_is_an_invalid_path() {
    let processor = TemplateProcessor::new();
    let mut extracted = HashMap::new();
    extracted.insert("report".to_string(), json!({"meta": {"author": "analyst"}}));

    // A miss with segments still to walk cannot be traversed further, so it
    // downgrades to Invalid path; only a final-segment miss is Missing.
    let template = json!({
        "head_gone": "{ghost.field}",
        "head_gone_deep": "{ghost.a.b}",
        "mid_gone": "{report.nothere.author}",
        "tail_gone": "{report.meta.nothere}",
    });
    let formatted = processor.format_output(&template, &extracted);
    assert_eq!(formatted["head_gone"], "[Invalid path: ghost.field]");
    assert_eq!(formatted["head_gone_deep"], "[Invalid path: ghost.a.b]");
    assert_eq!(formatted["mid_gone"], "[Invalid path: report.nothere.author]");
    assert_eq!(formatted["tail_gone"], "[Missing: report.meta.nothere]");
}

#[test]
fn test_nested_path_resolution() {
    let processor = TemplateProcessor::new();
    let mut extracted = HashMap::new();
    extracted.insert("report".to_string(), json!({"meta": {"author": "analyst"}}));

    let template = json!({"who": "{report.meta.author}", "gone": "{report.meta.missing}"});
    let formatted = processor.format_output(&template, &extracted);
    assert_eq!(formatted["who"], "analyst");
    assert_eq!(formatted["gone"], "[Missing: report.meta.missing]");
}

#[test]
fn test_non_string_leaves_pass_through() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[("team_a", "some output")]);

    let template = json!({"n": 7, "flag": false, "empty": null, "text": "{summary}"});
    let rules = json!({"summary": "summarize everything"});
    let formatted = processor.process(&template, &rules, &results).unwrap();
    assert_eq!(formatted["n"], 7);
    assert_eq!(formatted["flag"], false);
    assert_eq!(formatted["empty"], serde_json::Value::Null);
    assert!(formatted["text"].as_str().unwrap().contains("some output"));
}

#[test]
fn test_generic_fallback_uses_field_name() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[("team_a", "plain output text")]);
    let rules = processor
        .validate_extraction_rules(&json!({
            "team_count": "how many groups took part",
            "final_status": "overall state of the run",
            "total_time": "how long it took",
            "anything": "whatever is relevant"
        }))
        .unwrap();

    let extracted = processor.extract_information(&rules, &results);
    assert_eq!(extracted["team_count"], json!(1));
    assert_eq!(extracted["final_status"], json!("completed"));
    assert_eq!(extracted["total_time"], json!(120));
    assert_eq!(extracted["anything"], json!("plain output text"));
}

#[test]
fn test_extra_rules_without_placeholders_are_allowed() {
    let processor = TemplateProcessor::new();
    let results = output_with(&[("team_a", "output")]);

    let template = json!({"only": "{summary}"});
    let rules = json!({
        "summary": "summarize",
        "unused": "extract trends from the analysis"
    });
    assert!(processor.process(&template, &rules, &results).is_ok());
}

#[test]
fn test_recommendation_extraction_honors_numeric_limit() {
    let processor = TemplateProcessor::new();
    let output = "建议加强数据治理与隐私保护。建议推进模型可解释性研究工作。\
                  建议完善行业监管框架体系。建议培养跨学科人才队伍建设。";
    let results = output_with(&[("team_a", output)]);
    let rules = processor
        .validate_extraction_rules(&json!({"recs": "基于分析结果提供2条具体建议"}))
        .unwrap();

    let extracted = processor.extract_information(&rules, &results);
    assert_eq!(extracted["recs"].as_array().unwrap().len(), 2);
}

#[test]
fn test_data_source_extraction_parses_marked_lines() {
    let processor = TemplateProcessor::new();
    let output = "Findings summary.\nSource: PubMed Central\n来源：行业白皮书";
    let results = output_with(&[("team_a", output)]);
    let rules = processor
        .validate_extraction_rules(&json!({"sources": "list the data sources used"}))
        .unwrap();

    let extracted = processor.extract_information(&rules, &results);
    let sources: Vec<&str> = extracted["sources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(sources.contains(&"PubMed Central"));
    assert!(sources.contains(&"行业白皮书"));
}
