mod impls;
mod mercado;
mod requests;
mod responses;
mod util;

pub use self::mercado::*;
pub use impls::*;
pub use requests::*;
pub use responses::*;
pub use util::*;
