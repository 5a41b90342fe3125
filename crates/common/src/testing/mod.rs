mod extractor;
mod test_catalog;
mod test_environment;

pub use self::{
    extractor::{
        JsonFieldExtractor,
        KeyComponentExtractor,
    },
    test_catalog::TestCatalog,
    test_environment::TestEnvironment,
};
