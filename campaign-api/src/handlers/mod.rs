mod app;
mod campaigns;

pub use app::add_routes;
