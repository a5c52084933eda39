pub mod detection;
pub mod inpaint;
pub mod translation;
pub mod typeset;

pub use detection::{DirectOutput, DirectTranslator, TextDetector};
pub use inpaint::Inpainter;
pub use translation::{HttpTranslator, TranslationMemo, Translator};
pub use typeset::Typesetter;
