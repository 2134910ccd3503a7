use itertools::Itertools;
use serde::Deserialize;

use crate::db::VacancyRow;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub search_field: String,
    pub per_page: u32,
}

impl SearchQuery {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            text: settings.search_text.clone(),
            search_field: settings.search_field.clone(),
            per_page: settings.per_page,
        }
    }

    pub fn params(&self, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("text", self.text.clone()),
            ("search_field", self.search_field.clone()),
            ("per_page", self.per_page.to_string()),
            ("page", page.to_string()),
        ]
    }

    /// Pages (0-based) needed to cover `total` vacancies.
    pub fn pages_for(&self, total: u32) -> u32 {
        total.div_ceil(self.per_page)
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    #[serde(default)]
    pub found: u64,
    #[serde(default)]
    pub pages: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchItem {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct VacancyDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub employer: Option<Employer>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub key_skills: Vec<KeySkill>,
}

#[derive(Debug, Deserialize)]
pub struct Employer {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeySkill {
    pub name: String,
}

impl From<VacancyDetail> for VacancyRow {
    fn from(v: VacancyDetail) -> Self {
        VacancyRow {
            key_skills: v.key_skills.iter().map(|s| s.name.trim()).join(", "),
            id: v.id,
            company_name: v.employer.and_then(|e| e.name).unwrap_or_default(),
            position: v.name,
            job_description: v.description.unwrap_or_default(),
        }
    }
}
