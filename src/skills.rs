use std::collections::HashMap;

use anyhow::Result;
use rusqlite::Connection;

use crate::db;

const SKILL_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillCount {
    pub skill: String,
    pub count: usize,
}

/// Most common skills across `", "`-joined fields. Ties keep first-seen order.
pub fn rank_skills<'a, I>(fields: I, limit: usize) -> Vec<SkillCount>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    let skills = fields
        .into_iter()
        .flat_map(|f| f.split(SKILL_SEPARATOR))
        .map(str::trim)
        .filter(|s| !s.is_empty());
    for (seen, skill) in skills.enumerate() {
        counts.entry(skill).or_insert((0, seen)).0 += 1;
    }

    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|(_, (ca, fa)), (_, (cb, fb))| cb.cmp(ca).then(fa.cmp(fb)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(skill, (count, _))| SkillCount {
            skill: skill.to_string(),
            count,
        })
        .collect()
}

/// Top skills among vacancies posted by loaded companies.
pub fn top_skills(conn: &Connection, companies_table: &str, limit: usize) -> Result<Vec<SkillCount>> {
    let fields = db::fetch_company_skills(conn, companies_table)?;
    Ok(rank_skills(fields.iter().map(String::as_str), limit))
}
