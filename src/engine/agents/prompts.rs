// Tahlil Engine — Agent Prompt Families
//
// Shared builders for the three prompt shapes every agent uses: the think
// call, the answer call, and the cached-context chat call. Each agent
// contributes its persona line and mission brief. The scaffolding
// (evidence framing, output rules, privacy rules) is identical across
// the panel and lives here once.

/// Think call: a long private reasoning pass over the evidence. The output
/// is never shown to users and is discarded after the answer call.
pub fn think_prompt(persona: &str, mission: &str, evidence: &str) -> String {
    format!(
        "{persona}\n\n\
         Work through the evidence below step by step. Think broadly and \
         deeply: quantify, compare, look for what is surprising, and note \
         anything the user should act on. This reasoning is private — do \
         not address the user and do not format for presentation.\n\n\
         Your mission:\n{mission}\n\n\
         Evidence ({count} records):\n{evidence}",
        persona = persona,
        mission = mission,
        count = evidence.lines().count(),
        evidence = evidence,
    )
}

/// Answer call: turn the private reasoning into the user-facing report.
pub fn answer_prompt(persona: &str, mission: &str, thinking: &str, evidence: &str) -> String {
    format!(
        "{persona}\n\n\
         You already analysed this data. Your private notes:\n\
         ---\n{thinking}\n---\n\n\
         Evidence:\n{evidence}\n\n\
         Now write the report for the user covering:\n{mission}\n\n\
         Rules: markdown with headings, bullet lists and a table where it \
         helps; concrete numbers from the evidence only — never invent \
         figures; lead with what matters most; keep it under 600 words.",
    )
}

/// Chat call: answer one question using the cached insights as context.
pub fn chat_prompt(persona: &str, cached_summary: &str, evidence: &str, query: &str) -> String {
    format!(
        "{persona}\n\n\
         Your earlier analysis of this workspace:\n\
         ---\n{cached}\n---\n\n\
         Fresh evidence matching the question:\n{evidence}\n\n\
         Question: {query}\n\n\
         Answer directly and concretely from the analysis and evidence \
         above. Quote exact amounts and dates where relevant. If the data \
         does not contain the answer, say so — do not guess.",
        persona = persona,
        cached = cached_summary,
        evidence = evidence,
        query = query,
    )
}
