mod hierarchy;
mod relations;
