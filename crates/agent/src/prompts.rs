use credeval_core::domain::conversation::EvaluationType;

const ROLE: &str = "You are an educational credential analyst. You read scanned academic \
documents (diplomas, transcripts, degree certificates) and extract a structured evaluation \
of every credential they contain.";

const TOOL_RULES: &str = r#"## Reference catalog tools
You can query a read-only reference catalog:
1. search_countries(query): find the exact catalog country name.
2. find_institutions(country_name, query): match the issuing institution within a country.
3. get_foreign_credentials(country_name[, query]): credential types recorded for a country.
4. get_program_lengths(country_name[, query]): typical program lengths for a country.
5. get_grade_scales(country_name[, query]): grading scales for a country.
6. get_us_equivalencies([query]): U.S. equivalency statements.

Every record a tool returns carries an "id". Rules for catalog matches:
- Resolve the country first with search_countries and use the returned country name for
  every country-scoped tool.
- Put a record's "id" in "validated_id" only if a tool call in this conversation returned
  that exact id for that kind of record. Never invent, guess or modify an id.
- If no tool result matches, set "validated_id" to null and choose "low" or "not_found".
- The display text of matched fields is taken from the catalog, so copy the document text
  verbatim into "extracted_value" instead of rewriting it."#;

const FIELD_SHAPE: &str = r#"{"extracted_value": "text exactly as written in the document", "validated_id": "id from a tool result or null", "confidence": "high|medium|low|not_found"}"#;

fn output_schema(include_courses: bool) -> String {
    let courses = if include_courses {
        r#",
      "course_analysis": [
        {"section_name": "Year 1 / Semester 1", "courses": [{"subject": "Calculus I"}]}
      ]"#
    } else {
        ""
    };
    format!(
        r#"## Output
Reply with a single JSON object in a ```json fenced block and nothing else:
```json
{{
  "analysis_summary": {{
    "total_credentials_found": 1,
    "document_type": "Diploma|Transcript|Degree Certificate|...",
    "analysis_confidence": "high|medium|low"
  }},
  "credentials": [
    {{
      "credential_id": "credential_1",
      "country": {field},
      "institution": {field},
      "foreign_credential": {field},
      "program_length": {field},
      "grade_scale": {field},
      "us_equivalency": {field},
      "program_of_study": "string or null",
      "award_date": "YYYY-MM-DD or partial date, or null",
      "attendance_dates": {{"periods": [{{"start_date": "YYYY", "end_date": "YYYY"}}]}},
      "additional_info": {{"grades": "string or null", "honors": "string or null", "notes": "string or null"}}{courses}
    }}
  ],
  "extraction_notes": ["anything unclear, ambiguous or illegible"]
}}
```
"analysis_summary" and "credentials" are required."#,
        field = FIELD_SHAPE,
        courses = courses,
    )
}

pub fn general_instructions() -> String {
    format!(
        "{ROLE}\n\nThis is a GENERAL evaluation: determine the overall U.S. equivalency of each \
credential. Do not analyse individual courses.\n\n{TOOL_RULES}\n\n{}",
        output_schema(false)
    )
}

pub fn course_by_course_instructions() -> String {
    format!(
        "{ROLE}\n\nThis is a COURSE-BY-COURSE evaluation: in addition to the overall U.S. \
equivalency, list every course of each credential under \"course_analysis\", grouped by \
the sections (years, semesters or terms) used in the document. Record the subject exactly \
as written.\n\n{TOOL_RULES}\n\n{}",
        output_schema(true)
    )
}

pub fn instructions_for(evaluation_type: EvaluationType) -> String {
    match evaluation_type {
        EvaluationType::General => general_instructions(),
        EvaluationType::CourseByCourse => course_by_course_instructions(),
    }
}

/// Sent once after a final answer that could not be used.
pub fn corrective_prompt(problem: &str) -> String {
    format!(
        "Your previous answer could not be used: {problem}. Reply again with only the JSON \
object described in the instructions, inside a ```json fenced block. It must contain \
\"analysis_summary\" and \"credentials\". Do not call tools unless you still need catalog \
data."
    )
}

#[cfg(test)]
mod tests {
    use credeval_core::domain::conversation::EvaluationType;

    use super::{corrective_prompt, instructions_for};

    #[test]
    fn instructions_name_every_tool_and_required_key() {
        for evaluation_type in [EvaluationType::General, EvaluationType::CourseByCourse] {
            let text = instructions_for(evaluation_type);
            for tool in [
                "search_countries",
                "find_institutions",
                "get_foreign_credentials",
                "get_program_lengths",
                "get_grade_scales",
                "get_us_equivalencies",
            ] {
                assert!(text.contains(tool), "{tool} missing");
            }
            assert!(text.contains("validated_id"));
            assert!(text.contains("analysis_summary"));
        }
    }

    #[test]
    fn only_course_by_course_asks_for_courses() {
        assert!(!instructions_for(EvaluationType::General).contains("course_analysis"));
        assert!(instructions_for(EvaluationType::CourseByCourse).contains("course_analysis"));
        assert!(corrective_prompt("missing credentials").contains("missing credentials"));
    }
}
