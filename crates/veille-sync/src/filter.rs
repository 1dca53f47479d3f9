use veille_core::Opportunity;

/// Case-insensitive include/exclude keyword gate. Exclusion always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl KeywordFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().map(|word| word.to_lowercase()).collect(),
            exclude: exclude.iter().map(|word| word.to_lowercase()).collect(),
        }
    }

    pub fn accepts(&self, item: &Opportunity) -> bool {
        let text = keyword_blob(item);

        if self.exclude.iter().any(|word| text.contains(word.as_str())) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|word| text.contains(word.as_str()))
    }
}

fn keyword_blob(item: &Opportunity) -> String {
    [
        item.title.as_str(),
        item.description.as_str(),
        item.issuer.as_str(),
        item.kind.code(),
        item.tags.join(" ").as_str(),
    ]
    .join(" ")
    .to_lowercase()
}
